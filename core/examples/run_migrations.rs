use sopline_core::InitBuilder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("Running database migrations...");

    let app = InitBuilder::new()
        .auto_migrate(true)
        .require_initialized(false)
        .init()
        .await?;

    println!(
        "✓ Migrations completed successfully! ({})",
        app.config().database.url.as_deref().unwrap_or_default()
    );
    Ok(())
}
