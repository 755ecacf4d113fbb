use anyhow::Context;
use log::info;

use heapcmt::*;

/// Annotates a malloc trace with lifetimes, neighbours and page overhead
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the trace, as printed by `trace2cmt -s`
    #[arg(value_parser = clap::value_parser!(PathBuf))]
    input:      PathBuf,

    /// What to annotate
    #[arg(short, long, value_enum, default_value_t = Mode::Overhead)]
    mode:       Mode,

    /// Column at which annotations start
    #[arg(short, long, default_value_t = DEFAULT_WIDTH)]
    width:      usize,

    /// Page size used for page accounting
    #[arg(short, long, default_value_t = PAGE_SIZE)]
    #[arg(value_parser = parse_page_size)]
    page_size:  ByteSteps,
}

fn parse_page_size(s: &str) -> Result<ByteSteps, String> {
    match s.parse::<ByteSteps>() {
        Ok(0)   => Err(String::from("page size must be non-zero")),
        Ok(v)   => Ok(v),
        Err(e)  => Err(e.to_string()),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Args::parse();
    let fd = std::fs::File::open(&cli.input)
        .with_context(|| format!("{}", cli.input.display()))?;
    let stdout = std::io::stdout();
    let out = std::io::BufWriter::new(stdout.lock());

    let mut annotator = Annotator::new(
        HeapTracker::with_page_size(cli.page_size),
        cli.mode,
        cli.width,
    );
    let lines = annotator
        .run(BufReader::new(fd), out)
        .with_context(|| format!("{}", cli.input.display()))?;

    let heap = annotator.heap();
    info!("{} lines, {} blocks ({} bytes) still live, peak {} bytes",
        lines,
        heap.live_count(),
        heap.live_bytes(),
        heap.peak_live_bytes(),
    );

    Ok(())
}
