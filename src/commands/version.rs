pub fn run() -> anyhow::Result<()> {
    println!("kubearchive {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
