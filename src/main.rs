#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = gradecast::run_worker().await {
        eprintln!("gradecast fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
