#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(err) = gpu_lease_cli::cli::run().await {
        eprintln!("{}", gpu_lease_cli::output::render_error(&err));
        std::process::exit(1);
    }
    Ok(())
}
