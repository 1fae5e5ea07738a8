use anyhow::Result;

fn main() -> Result<()> {
    let code = rulebox::cli::run()?;
    std::process::exit(code)
}
