//! Generative canon: one forked voice per part, each at its own rate

use anyhow::{bail, Context};
use cadenza_core::{Clock, CurveShape, ForkOptions};
use cadenza_services::{Instrument, Performance, Session};
use tracing::info;

use crate::config::AppConfig;

const PENTATONIC: [f64; 5] = [0.0, 2.0, 4.0, 7.0, 9.0];
const BASE_PITCH: f64 = 60.0;

/// Child beats per master beat for voice `index`
fn voice_rate(index: usize) -> f64 {
    1.0 + index as f64 * 0.5
}

fn voice_pitch(index: usize, step: usize) -> f64 {
    let degree = PENTATONIC[(step * (index + 2)) % PENTATONIC.len()];
    let octave = if index % 2 == 0 { 0.0 } else { -12.0 };
    BASE_PITCH + degree + octave
}

fn play_voice(part: &Instrument, clock: &Clock, index: usize, notes: usize) -> cadenza_services::Result<()> {
    let volume = 0.8 / (index as f64 + 1.0);
    for step in 0..notes {
        part.play_note(clock, voice_pitch(index, step), volume, 1.0)?;
    }
    Ok(())
}

pub fn run(config: &AppConfig) -> anyhow::Result<Performance> {
    if config.voices == 0 {
        bail!("at least one voice is required");
    }
    if !config.beats.is_finite() || config.beats <= 0.0 {
        bail!("piece length must be positive, got {}", config.beats);
    }

    let session = Session::new(config.tempo).context("creating session")?;
    if let Some(target) = config.ramp_to {
        session
            .set_tempo_target(target, config.ramp_beats, CurveShape::Linear)
            .context("scheduling tempo ramp")?;
    }

    let parts: Vec<Instrument> = (0..config.voices)
        .map(|i| session.new_part(format!("voice {}", i + 1)))
        .collect();
    session.start_transcribing()?;

    let mut voices = Vec::with_capacity(parts.len());
    for (index, part) in parts.into_iter().enumerate() {
        let rate = voice_rate(index);
        let notes = (config.beats * rate).floor() as usize;
        let options = ForkOptions::synchronized().named(part.name().to_string()).with_rate(rate);
        voices.push(session.fork_with(options, move |clock| play_voice(&part, clock, index, notes))?);
    }
    session.wait_for_children_to_finish()?;

    for voice in voices {
        voice.join_checked()??;
    }
    let performance = session.stop_transcribing()?;
    info!(
        notes = performance.note_count(),
        beats = session.beats(),
        seconds = session.time(),
        "Canon finished"
    );
    session.stop();
    Ok(performance)
}
