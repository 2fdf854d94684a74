use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use precise_metronome::{CpalClock, ManualClock, Metronome, MetronomeConfig, Tick};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(
    name = "metronome_cli",
    about = "Lookahead metronome: play on the default device or simulate ticks"
)]
struct Cli {
    /// Load configuration from this JSON file (defaults apply when missing)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play on the default output device
    Play {
        #[arg(long)]
        bpm: Option<f64>,
        #[arg(long)]
        meter: Option<u32>,
        /// Accent mask such as 1,0,0,0
        #[arg(long)]
        accents: Option<String>,
        #[arg(long, default_value_t = 10.0)]
        seconds: f64,
    },
    /// Drive a simulated clock and print each tick as a JSON line
    Simulate {
        #[arg(long)]
        bpm: Option<f64>,
        #[arg(long)]
        meter: Option<u32>,
        #[arg(long)]
        accents: Option<String>,
        #[arg(long, default_value_t = 8)]
        beats: usize,
    },
    /// Print the effective configuration
    DumpConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = cli
        .config
        .as_ref()
        .map(MetronomeConfig::load_from_file)
        .unwrap_or_default();

    match cli.command {
        Commands::Play {
            bpm,
            meter,
            accents,
            seconds,
        } => {
            let accents = accents.as_deref().map(parse_accents).transpose()?;
            run_play(config, bpm, meter, accents, seconds).await
        }
        Commands::Simulate {
            bpm,
            meter,
            accents,
            beats,
        } => {
            let accents = accents.as_deref().map(parse_accents).transpose()?;
            run_simulate(config, bpm, meter, accents, beats).await
        }
        Commands::DumpConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(ExitCode::from(0))
        }
    }
}

fn apply_settings(
    metronome: &Metronome,
    bpm: Option<f64>,
    meter: Option<u32>,
    accents: Option<Vec<bool>>,
) {
    if let Some(bpm) = bpm {
        metronome.set_bpm(bpm);
    }
    match (meter, accents) {
        (Some(meter), Some(accents)) => metronome.set_meter_with_accents(meter, accents),
        (Some(meter), None) => metronome.set_meter(meter),
        (None, Some(accents)) => metronome.set_accents(accents),
        (None, None) => {}
    }
}

async fn run_play(
    config: MetronomeConfig,
    bpm: Option<f64>,
    meter: Option<u32>,
    accents: Option<Vec<bool>>,
    seconds: f64,
) -> Result<ExitCode> {
    if !seconds.is_finite() || seconds <= 0.0 {
        bail!("--seconds must be a positive number, got {seconds}");
    }

    let clock = Arc::new(CpalClock::new());
    let metronome = Metronome::from_config(config, clock.clone());
    apply_settings(&metronome, bpm, meter, accents);

    let subscription = metronome.on_tick(|tick| {
        tracing::info!(
            "beat {}{} at {:.4}s",
            tick.pulse,
            if tick.is_accented { " (accent)" } else { "" },
            tick.time
        );
    });

    metronome
        .start()
        .await
        .context("starting the audio clock")?;
    tracing::info!("Playing at {} Hz output", clock.sample_rate());

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
        }
    }

    subscription.unsubscribe();
    metronome.dispose();
    Ok(ExitCode::from(0))
}

#[derive(Serialize)]
struct SimulatedTick {
    beat: usize,
    #[serde(flatten)]
    tick: Tick,
}

async fn run_simulate(
    config: MetronomeConfig,
    bpm: Option<f64>,
    meter: Option<u32>,
    accents: Option<Vec<bool>>,
    beats: usize,
) -> Result<ExitCode> {
    let step = config.scheduling.lookahead_ms / 1000.0;
    let clock = Arc::new(ManualClock::new());
    let metronome = Metronome::from_config(config, clock.clone());
    apply_settings(&metronome, bpm, meter, accents);

    let (subscription, mut ticks) = metronome.subscribe_ticks();
    metronome.start().await?;

    let mut emitted = 0;
    while emitted < beats {
        while let Ok(tick) = ticks.try_recv() {
            emitted += 1;
            let line = SimulatedTick {
                beat: emitted,
                tick,
            };
            println!("{}", serde_json::to_string(&line)?);
            if emitted == beats {
                break;
            }
        }
        let now = clock.advance(step);
        metronome.run_once(now);
    }

    subscription.unsubscribe();
    metronome.dispose();
    Ok(ExitCode::from(0))
}

fn parse_accents(raw: &str) -> Result<Vec<bool>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part {
            "1" | "x" | "X" | "true" => Ok(true),
            "0" | "-" | "." | "false" => Ok(false),
            other => bail!("invalid accent value '{other}' (use 1/0)"),
        })
        .collect()
}
