use anyhow::{Context, Result};
use tracing::info;

use crate::cli::{Run, SummaryFormat};
use crate::session::{Outcome, SpeedTest};
use crate::tui::run_tui;

pub fn run_client(run: Run) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Building tokio runtime")?;
    let test = SpeedTest::new(reqwest::Client::new(), &run.url, run.size_mb, run.units())?;

    if !run.headless {
        return run_tui(&runtime, &test);
    }

    let session = test.start().context("A measurement is already running")?;
    {
        let stop = session.stop_handle();
        let _ = ctrlc::set_handler(move || stop.stop());
    }
    info!(url = %test.url(), "Running headless measurement");
    let outcome = runtime
        .block_on(session.run(|_| {}))
        .with_context(|| format!("Downloading {}", test.url()))?;
    println!("{}", render_summary(&outcome, run.format)?);
    Ok(())
}

pub(crate) fn render_summary(outcome: &Outcome, format: SummaryFormat) -> Result<String> {
    match format {
        SummaryFormat::Json => Ok(serde_json::to_string_pretty(outcome)?),
        SummaryFormat::Text => {
            let s = outcome.summary();
            let status = match outcome {
                Outcome::Finished(_) => "finished",
                Outcome::Stopped(_) => "stopped",
            };
            Ok(format!(
                "{status}\t{} / {} bytes\t{:.2}s\t{:.1} Mbps average\t{:.1} Mbps smoothed",
                s.bytes, s.expected, s.elapsed_secs, s.mean_mbps, s.display_mbps
            ))
        }
    }
}
