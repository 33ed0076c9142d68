use resilient_http::{http_client_factory, ClientConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("resilient_http=debug")),
        )
        .init();

    let config = ClientConfig::from_env().map_err(anyhow::Error::msg)?;
    let factory = http_client_factory(config);
    let client = factory.build().await?;

    let response = client.get("https://postman-echo.com/delay/0").await?;
    println!("{} {}", response.status, response.text());

    Ok(())
}
