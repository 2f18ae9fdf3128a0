//! cadenza: play a generative canon on a clock tree and print its transcription

mod config;
mod demo;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "cadenza", version, about = "Play a generative canon on a clock tree")]
struct Cli {
    /// Master tempo in BPM
    #[arg(long)]
    tempo: Option<f64>,

    /// Number of forked voices
    #[arg(long)]
    voices: Option<usize>,

    /// Length of the piece in master beats
    #[arg(long)]
    beats: Option<f64>,

    /// Ramp the master tempo towards this BPM
    #[arg(long)]
    ramp_to: Option<f64>,

    /// Length of the tempo ramp in beats
    #[arg(long)]
    ramp_beats: Option<f64>,

    /// Config file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the merged settings back to the config file
    #[arg(long)]
    save_config: bool,

    /// Print the performance as single-line JSON
    #[arg(long)]
    compact: bool,
}

impl Cli {
    fn merge_into(&self, config: &mut AppConfig) {
        if let Some(tempo) = self.tempo {
            config.tempo = tempo;
        }
        if let Some(voices) = self.voices {
            config.voices = voices;
        }
        if let Some(beats) = self.beats {
            config.beats = beats;
        }
        if self.ramp_to.is_some() {
            config.ramp_to = self.ramp_to;
        }
        if let Some(ramp_beats) = self.ramp_beats {
            config.ramp_beats = ramp_beats;
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("cadenza=info".parse()?))
        .init();

    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(config::config_path);
    let mut settings = config::load_config(&path);
    cli.merge_into(&mut settings);

    tracing::info!(
        tempo = settings.tempo,
        voices = settings.voices,
        beats = settings.beats,
        "Starting cadenza"
    );

    if cli.save_config {
        config::save_config(&path, &settings)
            .with_context(|| format!("saving config to {}", path.display()))?;
    }

    let performance = demo::run(&settings)?;
    let json = if cli.compact {
        serde_json::to_string(&performance)?
    } else {
        serde_json::to_string_pretty(&performance)?
    };
    println!("{json}");
    Ok(())
}
