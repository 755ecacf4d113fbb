use anyhow::{bail, Context};
use log::info;

use heapcmt::{*, convert::Converter, cmt::CmtEncoder};

/// Converts raw malloc traces into the compact or the human-readable form
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the raw `call-trace` log
    #[arg(value_parser = clap::value_parser!(PathBuf))]
    input:  PathBuf,

    /// Where to write the compact trace
    #[arg(short, long, value_parser = clap::value_parser!(PathBuf))]
    output: Option<PathBuf>,

    /// Print the human-readable form to stdout instead
    #[arg(short, long, default_value_t = false)]
    simple: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Args::parse();
    if cli.output.is_none() && !cli.simple {
        bail!("specify either -s or -o");
    }
    let fd = std::fs::File::open(&cli.input)
        .with_context(|| format!("{}", cli.input.display()))?;
    // With both flags, the human-readable form goes to the file.
    let out: Box<dyn Write> = match &cli.output {
        Some(p) => {
            let f = std::fs::File::create(p)
                .with_context(|| format!("{}", p.display()))?;
            Box::new(std::io::BufWriter::new(f))
        },
        None    => Box::new(std::io::BufWriter::new(std::io::stdout().lock())),
    };

    let mut converter = Converter::new();
    let input = BufReader::new(fd);
    let events = if cli.simple {
        let mut out = out;
        let n = scan_all(input, &mut converter, |e| Ok(writeln!(out, "{}", e)?))?;
        out.flush()?;
        n
    } else {
        let mut enc = CmtEncoder::new(out);
        let n = scan_all(input, &mut converter, |e| Ok(enc.encode_event(e)?))?;
        enc.flush()?;
        n
    };
    info!("{} events, {} pointers never freed", events, converter.tags().live_count());

    Ok(())
}

/// Feeds every raw line to `converter` and every resulting event to
/// `sink`. Failures are reported with their 1-based line number.
fn scan_all<R: BufRead>(
    input:      R,
    converter:  &mut Converter,
    mut sink:   impl FnMut(&Event) -> anyhow::Result<()>,
) -> anyhow::Result<usize> {
    let mut events = 0;
    for (idx, l) in input.lines().enumerate() {
        let line = idx + 1;
        let text = l.with_context(|| format!("line {}", line))?;
        if let Some(e) = converter.scan(&text).with_context(|| format!("line {}", line))? {
            sink(&e).with_context(|| format!("line {}", line))?;
            events += 1;
        }
    }

    Ok(events)
}
