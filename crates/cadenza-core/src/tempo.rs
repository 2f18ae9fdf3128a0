//! Tempo curves and beat/time conversion
//!
//! A curve maps a clock's own beat position to its tempo in beats per minute of
//! the parent's units: seconds for a root clock, parent beats for a child. A
//! tempo of 60 is therefore a rate of 1.

use serde::{Deserialize, Serialize};

use crate::error::{ClockError, Result};

const FLAT_EPSILON: f64 = 1e-12;

/// How tempo travels from the previous control point to this one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CurveShape {
    /// Hold the previous tempo, then step to this one at the point
    #[default]
    Jump,
    /// Tempo interpolated linearly in beats
    Linear,
    /// Tempo interpolated geometrically in beats
    Exponential,
}

/// A single tempo control point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempoPoint {
    /// Beat position on the owning clock
    pub beat: f64,
    /// Tempo in BPM
    pub tempo: f64,
    /// Shape of the segment ending at this point
    pub shape: CurveShape,
}

impl TempoPoint {
    pub fn new(beat: f64, tempo: f64) -> Self {
        Self { beat, tempo, shape: CurveShape::Jump }
    }

    pub fn with_shape(beat: f64, tempo: f64, shape: CurveShape) -> Self {
        Self { beat, tempo, shape }
    }
}

/// Piecewise tempo function over beat position
///
/// Always holds at least one point. Before the first point the curve holds the
/// first tempo; after the last point it holds the last tempo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<TempoPoint>", into = "Vec<TempoPoint>")]
pub struct TempoCurve {
    points: Vec<TempoPoint>,
}

impl TempoCurve {
    /// A curve holding one tempo forever
    pub fn constant(tempo: f64) -> Result<Self> {
        validate_tempo(tempo)?;
        Ok(Self {
            points: vec![TempoPoint::new(0.0, tempo)],
        })
    }

    /// Build a curve from control points, rejecting malformed input
    pub fn from_points(points: Vec<TempoPoint>) -> Result<Self> {
        if points.is_empty() {
            return Err(ClockError::invalid("tempo curve needs at least one point"));
        }
        for point in &points {
            validate_beat(point.beat)?;
            validate_tempo(point.tempo)?;
        }
        let misordered = |w: &[TempoPoint]| {
            w[1].beat < w[0].beat || (w[1].beat == w[0].beat && w[1].shape != CurveShape::Jump)
        };
        if points.windows(2).any(misordered) {
            return Err(ClockError::invalid(
                "tempo curve beat positions must increase, repeating only for a jump",
            ));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[TempoPoint] {
        &self.points
    }

    /// Instantaneous tempo at a beat position
    pub fn tempo_at(&self, beat: f64) -> f64 {
        self.segments()
            .find(|s| beat < s.end)
            .map(|s| s.tempo_at(beat))
            .unwrap_or_else(|| self.last().tempo)
    }

    /// Instantaneous rate (beats per parent unit) at a beat position
    pub fn rate_at(&self, beat: f64) -> f64 {
        self.tempo_at(beat) / 60.0
    }

    /// Parent units elapsed between two beat positions
    pub fn span(&self, from: f64, to: f64) -> f64 {
        if to <= from {
            return 0.0;
        }
        self.segments()
            .filter(|s| s.end > from && s.start < to)
            .map(|s| s.span(from.max(s.start), to.min(s.end)))
            .sum()
    }

    /// Beat position reached after `units` parent units, starting at `from`
    pub fn beats_after(&self, from: f64, units: f64) -> f64 {
        if units <= 0.0 {
            return from;
        }
        if units.is_infinite() {
            return f64::INFINITY;
        }

        let mut position = from;
        let mut remaining = units;
        for segment in self.segments().filter(|s| s.end > from) {
            let (reached, used) = segment.advance(position.max(segment.start), remaining);
            position = reached;
            remaining -= used;
            if remaining <= 0.0 || reached < segment.end {
                break;
            }
        }
        position
    }

    /// Overwrite the curve from `beat` on with a jump to `tempo`
    pub fn set_tempo_at(&mut self, beat: f64, tempo: f64) -> Result<()> {
        validate_beat(beat)?;
        validate_tempo(tempo)?;
        self.cut_at(beat);
        self.place(TempoPoint::new(beat, tempo));
        Ok(())
    }

    /// Replace the curve from `beat` on with a ramp reaching `target` after `duration` beats
    pub fn ramp_to(&mut self, beat: f64, target: f64, duration: f64, shape: CurveShape) -> Result<()> {
        validate_beat(beat)?;
        validate_tempo(target)?;
        if !(duration.is_finite() && duration > 0.0) {
            return Err(ClockError::invalid(format!(
                "tempo ramp duration must be positive and finite, got {duration}"
            )));
        }

        let current = self.tempo_at(beat);
        self.cut_at(beat);
        self.place(TempoPoint::new(beat, current));
        self.points.push(TempoPoint::with_shape(beat + duration, target, shape));
        Ok(())
    }

    /// Drop every point after `beat`, ending the segment in progress there
    fn cut_at(&mut self, beat: f64) {
        let tempo = self.tempo_at(beat);
        let Some(next) = self.points.iter().position(|p| p.beat > beat) else {
            return;
        };
        let shape = if next == 0 { CurveShape::Jump } else { self.points[next].shape };
        self.points.truncate(next);
        let inside = self.points.last().is_none_or(|p| p.beat < beat);
        if inside && (next == 0 || shape != CurveShape::Jump) {
            self.points.push(TempoPoint::with_shape(beat, tempo, shape));
        }
    }

    /// Append `point` to a curve cut at its beat
    fn place(&mut self, point: TempoPoint) {
        match self.points.last_mut() {
            Some(last) if last.beat == point.beat && last.tempo == point.tempo => {}
            // a jump's own tempo only applies from its beat on
            Some(last) if last.beat == point.beat && last.shape == CurveShape::Jump => *last = point,
            _ => self.points.push(point),
        }
    }

    /// Append a control point after the last one
    pub fn push(&mut self, point: TempoPoint) -> Result<()> {
        validate_beat(point.beat)?;
        validate_tempo(point.tempo)?;
        if point.beat <= self.last().beat {
            return Err(ClockError::invalid(format!(
                "tempo point at beat {} is not after the last point at {}",
                point.beat,
                self.last().beat
            )));
        }
        self.points.push(point);
        Ok(())
    }

    fn last(&self) -> &TempoPoint {
        // non-empty by construction
        &self.points[self.points.len() - 1]
    }

    fn segments(&self) -> impl Iterator<Item = Segment> + '_ {
        let first = self.points[0];
        let last = *self.last();

        let lead = Segment::flat(f64::NEG_INFINITY, first.beat, first.tempo);
        let interior = self.points.windows(2).map(|w| Segment {
            start: w[0].beat,
            end: w[1].beat,
            from: w[0].tempo,
            to: w[1].tempo,
            shape: w[1].shape,
        });
        let tail = Segment::flat(last.beat, f64::INFINITY, last.tempo);

        std::iter::once(lead).chain(interior).chain(std::iter::once(tail))
    }
}

impl TryFrom<Vec<TempoPoint>> for TempoCurve {
    type Error = ClockError;

    fn try_from(points: Vec<TempoPoint>) -> Result<Self> {
        Self::from_points(points)
    }
}

impl From<TempoCurve> for Vec<TempoPoint> {
    fn from(curve: TempoCurve) -> Self {
        curve.points
    }
}

/// One stretch of the curve between neighbouring control points
#[derive(Debug, Clone, Copy)]
struct Segment {
    start: f64,
    end: f64,
    from: f64,
    to: f64,
    shape: CurveShape,
}

impl Segment {
    fn flat(start: f64, end: f64, tempo: f64) -> Self {
        Self { start, end, from: tempo, to: tempo, shape: CurveShape::Jump }
    }

    fn is_flat(&self) -> bool {
        self.shape == CurveShape::Jump
            || (self.to - self.from).abs() < FLAT_EPSILON
            || !(self.end - self.start).is_finite()
    }

    fn length(&self) -> f64 {
        self.end - self.start
    }

    fn tempo_at(&self, beat: f64) -> f64 {
        if self.is_flat() {
            return self.from;
        }
        let u = ((beat - self.start) / self.length()).clamp(0.0, 1.0);
        match self.shape {
            CurveShape::Linear => self.from + (self.to - self.from) * u,
            CurveShape::Exponential => self.from * (self.to / self.from).powf(u),
            CurveShape::Jump => self.from,
        }
    }

    /// Linear slope in BPM per beat
    fn slope(&self) -> f64 {
        (self.to - self.from) / self.length()
    }

    /// Exponential growth constant per beat
    fn growth(&self) -> f64 {
        (self.to / self.from).ln() / self.length()
    }

    fn span(&self, a: f64, b: f64) -> f64 {
        if b <= a {
            return 0.0;
        }
        if self.is_flat() {
            return 60.0 * (b - a) / self.from;
        }
        let (ta, tb) = (self.tempo_at(a), self.tempo_at(b));
        match self.shape {
            CurveShape::Linear => 60.0 / self.slope() * (tb / ta).ln(),
            CurveShape::Exponential => 60.0 / self.growth() * (1.0 / ta - 1.0 / tb),
            CurveShape::Jump => 60.0 * (b - a) / self.from,
        }
    }

    /// Move forward from `a` by at most `units`; returns the position and units used
    fn advance(&self, a: f64, units: f64) -> (f64, f64) {
        let available = self.span(a, self.end);
        if units >= available {
            return (self.end, available);
        }
        if self.is_flat() {
            return (a + units * self.from / 60.0, units);
        }

        let ta = self.tempo_at(a);
        let reached = match self.shape {
            CurveShape::Linear => {
                let k = self.slope();
                let tempo = ta * (units * k / 60.0).exp();
                self.start + (tempo - self.from) / k
            }
            CurveShape::Exponential => {
                let c = self.growth();
                let tempo = 1.0 / (1.0 / ta - units * c / 60.0);
                self.start + (tempo / self.from).ln() / c
            }
            CurveShape::Jump => a + units * self.from / 60.0,
        };
        (reached.clamp(a, self.end), units)
    }
}

fn validate_tempo(tempo: f64) -> Result<()> {
    if tempo.is_finite() && tempo > 0.0 {
        Ok(())
    } else {
        Err(ClockError::invalid(format!("tempo must be positive and finite, got {tempo}")))
    }
}

fn validate_beat(beat: f64) -> Result<()> {
    if beat.is_finite() && beat >= 0.0 {
        Ok(())
    } else {
        Err(ClockError::invalid(format!(
            "tempo point beat must be finite and non-negative, got {beat}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-9;

    fn ramp(from: f64, to: f64, beats: f64, shape: CurveShape) -> TempoCurve {
        TempoCurve::from_points(vec![
            TempoPoint::new(0.0, from),
            TempoPoint::with_shape(beats, to, shape),
        ])
        .unwrap()
    }

    #[test]
    fn test_constant_span() {
        let curve = TempoCurve::constant(120.0).unwrap();
        assert!((curve.span(0.0, 4.0) - 2.0).abs() < TOLERANCE);
        assert!((curve.beats_after(1.0, 2.0) - 5.0).abs() < TOLERANCE);
        assert_eq!(curve.span(3.0, 1.0), 0.0);
    }

    #[test]
    fn test_linear_ramp_integrates_analytically() {
        let curve = ramp(60.0, 120.0, 4.0, CurveShape::Linear);
        let expected = 4.0 * 2f64.ln();
        assert!((curve.span(0.0, 4.0) - expected).abs() < TOLERANCE);
        assert!((curve.tempo_at(2.0) - 90.0).abs() < TOLERANCE);
        assert!((curve.beats_after(0.0, expected) - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_exponential_round_trip() {
        let curve = ramp(60.0, 240.0, 8.0, CurveShape::Exponential);
        assert!((curve.tempo_at(4.0) - 120.0).abs() < 1e-9);

        let units = curve.span(0.0, 2.5);
        assert!((curve.beats_after(0.0, units) - 2.5).abs() < 1e-6);

        // past the end of the ramp the curve holds 240 BPM
        let beyond = curve.span(0.0, 10.0) - curve.span(0.0, 8.0);
        assert!((beyond - 0.5).abs() < TOLERANCE);
    }

    #[test]
    fn test_jump_holds_previous_tempo() {
        let curve = TempoCurve::from_points(vec![
            TempoPoint::new(0.0, 60.0),
            TempoPoint::new(2.0, 120.0),
        ])
        .unwrap();
        assert_eq!(curve.tempo_at(1.9), 60.0);
        assert_eq!(curve.tempo_at(2.0), 120.0);
        assert!((curve.span(0.0, 4.0) - 3.0).abs() < TOLERANCE);
        assert!((curve.beats_after(0.0, 3.0) - 4.0).abs() < TOLERANCE);
    }

    #[test]
    fn test_rejects_malformed_points() {
        assert!(TempoCurve::constant(0.0).is_err());
        assert!(TempoCurve::constant(f64::NAN).is_err());
        assert!(TempoCurve::from_points(vec![]).is_err());
        assert!(TempoCurve::from_points(vec![
            TempoPoint::new(2.0, 60.0),
            TempoPoint::new(1.0, 90.0),
        ])
        .is_err());

        let mut curve = TempoCurve::constant(60.0).unwrap();
        assert!(curve.push(TempoPoint::new(0.0, 80.0)).is_err());
        assert!(curve.ramp_to(1.0, 90.0, 0.0, CurveShape::Linear).is_err());
        assert!(curve.set_tempo_at(-1.0, 90.0).is_err());
    }

    #[test]
    fn test_set_tempo_discards_future_points() {
        let mut curve = ramp(60.0, 120.0, 8.0, CurveShape::Linear);
        let played = curve.span(0.0, 2.0);
        curve.set_tempo_at(2.0, 100.0).unwrap();

        assert_eq!(curve.points().len(), 3);
        assert!((curve.tempo_at(1.0) - 67.5).abs() < TOLERANCE);
        assert_eq!(curve.tempo_at(2.0), 100.0);
        assert_eq!(curve.tempo_at(5.0), 100.0);
        assert!((curve.span(0.0, 2.0) - played).abs() < TOLERANCE);
        assert!((curve.span(2.0, 4.0) - 1.2).abs() < TOLERANCE);
    }

    #[test]
    fn test_edits_mid_ramp_keep_played_tempi() {
        let mut curve = ramp(60.0, 240.0, 8.0, CurveShape::Exponential);
        let played = curve.span(0.0, 4.0);
        curve.ramp_to(4.0, 60.0, 2.0, CurveShape::Linear).unwrap();
        assert!((curve.tempo_at(2.0) - 60.0 * 2f64.sqrt()).abs() < TOLERANCE);
        assert!((curve.tempo_at(4.0) - 120.0).abs() < TOLERANCE);
        assert!((curve.tempo_at(5.0) - 90.0).abs() < TOLERANCE);
        assert!((curve.span(0.0, 4.0) - played).abs() < TOLERANCE);

        // a second edit at the same beat replaces the first
        curve.set_tempo_at(4.0, 30.0).unwrap();
        curve.set_tempo_at(4.0, 45.0).unwrap();
        assert_eq!(curve.tempo_at(4.0), 45.0);
        assert!((curve.tempo_at(3.0) - 60.0 * 8f64.powf(0.25)).abs() < TOLERANCE);

        let restored = TempoCurve::from_points(curve.points().to_vec()).unwrap();
        assert_eq!(restored, curve);
    }

    #[test]
    fn test_repeated_beat_must_be_a_jump() {
        assert!(TempoCurve::from_points(vec![
            TempoPoint::new(0.0, 60.0),
            TempoPoint::with_shape(2.0, 90.0, CurveShape::Linear),
            TempoPoint::new(2.0, 120.0),
        ])
        .is_ok());
        assert!(TempoCurve::from_points(vec![
            TempoPoint::new(0.0, 60.0),
            TempoPoint::new(2.0, 90.0),
            TempoPoint::with_shape(2.0, 120.0, CurveShape::Linear),
        ])
        .is_err());
    }

    #[test]
    fn test_ramp_starts_from_current_tempo() {
        let mut curve = TempoCurve::constant(80.0).unwrap();
        curve.ramp_to(4.0, 160.0, 4.0, CurveShape::Linear).unwrap();
        assert_eq!(curve.tempo_at(3.0), 80.0);
        assert!((curve.tempo_at(6.0) - 120.0).abs() < TOLERANCE);
        assert_eq!(curve.tempo_at(9.0), 160.0);
    }
}
