#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = exam_engine::run_client().await {
        eprintln!("exam-client fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
