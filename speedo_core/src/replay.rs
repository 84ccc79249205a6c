use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::engine::{SampleSink, SampleSource, UpdateRequest};
use crate::geo::{haversine_distance_m, EARTH_RADIUS_M};
use crate::sample::{seconds_to_ns, Position, Sample, SourceEvent};
use crate::{kmh_to_ms, SpeedoError};

/// Speed profile of the built-in demo ride, one value per second.
pub const DEMO_SPEEDS_KMH: [f64; 14] = [
    8.0, 12.0, 28.0, 45.0, 60.0, 72.0, 90.0, 120.0, 70.0, 60.0, 20.0, 12.0, 0.0, 0.0,
];

const SEMICIRCLES_TO_DEGREES: f64 = 180.0 / 2_147_483_648.0;

#[derive(Default)]
struct ReplayState {
    queue: VecDeque<SourceEvent>,
    sink: Option<Weak<dyn SampleSink>>,
    last_request: Option<UpdateRequest>,
    request_count: usize,
    cancel_count: usize,
}

/// In-memory source that delivers queued events synchronously on
/// [`step`](ReplaySource::step) / [`drain`](ReplaySource::drain).
///
/// Events stay queued while no sink is registered. Delivering a
/// `ProviderEnabled` / `ProviderDisabled` event also flips the provider flag,
/// so readiness follows the replayed provider.
pub struct ReplaySource {
    permission_granted: AtomicBool,
    provider_enabled: AtomicBool,
    state: Mutex<ReplayState>,
}

impl Default for ReplaySource {
    fn default() -> Self {
        Self {
            permission_granted: AtomicBool::new(true),
            provider_enabled: AtomicBool::new(true),
            state: Mutex::new(ReplayState::default()),
        }
    }
}

impl ReplaySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events<I: IntoIterator<Item = SourceEvent>>(events: I) -> Self {
        let source = Self::new();
        source.extend(events);
        source
    }

    fn lock(&self) -> MutexGuard<'_, ReplayState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_permission_granted(&self, granted: bool) {
        self.permission_granted.store(granted, Ordering::SeqCst);
    }

    pub fn set_provider_enabled(&self, enabled: bool) {
        self.provider_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn push(&self, event: SourceEvent) {
        self.lock().queue.push_back(event);
    }

    pub fn extend<I: IntoIterator<Item = SourceEvent>>(&self, events: I) {
        self.lock().queue.extend(events);
    }

    /// Events not yet delivered.
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn last_request(&self) -> Option<UpdateRequest> {
        self.lock().last_request
    }

    pub fn request_count(&self) -> usize {
        self.lock().request_count
    }

    pub fn cancel_count(&self) -> usize {
        self.lock().cancel_count
    }

    /// True while a live sink is registered.
    pub fn is_delivering(&self) -> bool {
        self.current_sink().is_some()
    }

    fn current_sink(&self) -> Option<Arc<dyn SampleSink>> {
        self.lock().sink.as_ref().and_then(Weak::upgrade)
    }

    /// Deliver the next queued event. Returns `None` when the queue is empty
    /// or nobody is listening.
    pub fn step(&self) -> Option<SourceEvent> {
        let (event, sink) = {
            let mut state = self.lock();
            let sink = state.sink.as_ref().and_then(Weak::upgrade)?;
            let event = state.queue.pop_front()?;
            (event, sink)
        };
        match event {
            SourceEvent::ProviderEnabled => self.set_provider_enabled(true),
            SourceEvent::ProviderDisabled => self.set_provider_enabled(false),
            _ => {}
        }
        sink.on_event(event);
        Some(event)
    }

    /// Deliver events until the queue is empty or the sink goes away.
    /// Returns the number delivered.
    pub fn drain(&self) -> usize {
        let mut delivered = 0;
        while self.step().is_some() {
            delivered += 1;
        }
        delivered
    }
}

impl SampleSource for ReplaySource {
    fn is_ready(&self) -> bool {
        self.permission_granted.load(Ordering::SeqCst) && self.provider_enabled.load(Ordering::SeqCst)
    }

    fn request_updates(&self, request: UpdateRequest, sink: Weak<dyn SampleSink>) {
        debug!(
            "Replay updates requested: every {} ms / {} m",
            request.interval_ms, request.distance_m
        );
        let mut state = self.lock();
        state.sink = Some(sink);
        state.last_request = Some(request);
        state.request_count += 1;
    }

    fn cancel_updates(&self) {
        let mut state = self.lock();
        state.sink = None;
        state.cancel_count += 1;
    }
}

/// Straight northbound track following `speeds_kmh`, one sample every
/// `interval_ms`. Each sample sits where its own speed carried the device
/// since the previous one.
pub fn scripted_speeds(speeds_kmh: &[f64], interval_ms: u64, start: Position) -> Vec<SourceEvent> {
    let dt_s = interval_ms as f64 / 1000.0;
    let mut latitude = start.latitude;
    speeds_kmh
        .iter()
        .enumerate()
        .map(|(i, &kmh)| {
            let speed_mps = kmh_to_ms(kmh).max(0.0);
            if i > 0 {
                latitude += (speed_mps * dt_s / EARTH_RADIUS_M).to_degrees();
            }
            let position = Position {
                latitude,
                ..start
            };
            let timestamp_ns = (i as u64).saturating_mul(interval_ms).saturating_mul(1_000_000);
            SourceEvent::Sample(Sample::new(speed_mps, timestamp_ns).with_position(position))
        })
        .collect()
}

/// Parse a track into source events, using the provided format hint
/// (extension or bare name: `gpx`, `fit`, `csv`, `json`).
pub fn parse_events(input: &[u8], format: &str) -> Result<Vec<SourceEvent>, SpeedoError> {
    let format_lc = format.to_ascii_lowercase();
    let has = |ext: &str| format_lc == ext || format_lc.ends_with(&format!(".{ext}"));
    let events = if has("fit") {
        points_to_events(parse_fit_points(input)?)
    } else if has("gpx") {
        points_to_events(parse_gpx_points(input)?)
    } else if has("csv") {
        points_to_events(parse_csv_points(input)?)
    } else if has("json") {
        serde_json::from_slice::<Vec<SourceEvent>>(input)
            .map_err(|e| SpeedoError::JsonParse(e.to_string()))?
    } else {
        return Err(SpeedoError::UnsupportedFormat(format.to_string()));
    };
    if events.is_empty() {
        return Err(SpeedoError::InsufficientData);
    }
    debug!("Parsed {} events from {}", events.len(), format);
    Ok(events)
}

/// Counts over a parsed track, used to vet inputs before replay.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TrackSummary {
    pub samples: usize,
    pub lifecycle_events: usize,
    pub with_position: usize,
    /// Samples at or above the entry threshold passed to [`summarize_events`].
    pub moving: usize,
    pub out_of_order: usize,
    pub max_speed_mps: f64,
    pub span_s: f64,
}

pub fn summarize_events(events: &[SourceEvent], min_speed_running_mps: f64) -> TrackSummary {
    let mut summary = TrackSummary::default();
    let mut first: Option<u64> = None;
    let mut last: Option<u64> = None;
    let mut latest = 0u64;
    for event in events {
        let SourceEvent::Sample(sample) = event else {
            summary.lifecycle_events += 1;
            continue;
        };
        summary.samples += 1;
        if sample.position.is_some() {
            summary.with_position += 1;
        }
        let speed = sample.speed();
        if speed >= min_speed_running_mps {
            summary.moving += 1;
        }
        summary.max_speed_mps = summary.max_speed_mps.max(speed);
        if last.is_some() && sample.timestamp_ns < latest {
            summary.out_of_order += 1;
        }
        latest = latest.max(sample.timestamp_ns);
        first = Some(first.map_or(sample.timestamp_ns, |t| t.min(sample.timestamp_ns)));
        last = Some(latest);
    }
    if let (Some(first), Some(last)) = (first, last) {
        summary.span_s = (last - first) as f64 / 1e9;
    }
    summary
}

/// One timestamped fix before rebasing.
#[derive(Clone, Copy, Debug)]
struct TrackPoint {
    t_s: f64,
    speed_mps: Option<f64>,
    position: Option<Position>,
}

/// Rebase times onto the earliest point and fill in missing speeds from the
/// distance covered since the previous fix.
fn points_to_events(points: Vec<TrackPoint>) -> Vec<SourceEvent> {
    let base = points
        .iter()
        .map(|p| p.t_s)
        .filter(|t| t.is_finite())
        .fold(f64::INFINITY, f64::min);
    let mut previous: Option<TrackPoint> = None;
    let mut out = Vec::with_capacity(points.len());
    for point in points {
        let speed_mps = point
            .speed_mps
            .or_else(|| derived_speed(previous.as_ref(), &point))
            .unwrap_or(0.0);
        let mut sample = Sample::new(speed_mps, seconds_to_ns(point.t_s - base));
        sample.position = point.position;
        out.push(SourceEvent::Sample(sample));
        previous = Some(point);
    }
    out
}

fn derived_speed(previous: Option<&TrackPoint>, point: &TrackPoint) -> Option<f64> {
    let previous = previous?;
    let (from, to) = (previous.position?, point.position?);
    let dt = point.t_s - previous.t_s;
    if dt <= 0.0 {
        return None;
    }
    Some(haversine_distance_m(from.latitude, from.longitude, to.latitude, to.longitude) / dt)
}

fn parse_fit_points(input: &[u8]) -> Result<Vec<TrackPoint>, SpeedoError> {
    use fitparser::de::from_bytes;
    use fitparser::profile::MesgNum;
    let records = from_bytes(input).map_err(|e| SpeedoError::FitParse(e.to_string()))?;
    let mut out = Vec::new();
    let mut t0: Option<DateTime<Utc>> = None;

    for record in records.into_iter() {
        if record.kind() != MesgNum::Record {
            continue;
        }
        let mut timestamp: Option<DateTime<Utc>> = None;
        let mut speed = None;
        let mut enhanced_speed = None;
        let (mut lat, mut lon, mut accuracy) = (None, None, None);
        for field in record.fields() {
            match field.name() {
                "timestamp" => {
                    if let fitparser::Value::Timestamp(ts) = field.value() {
                        let utc = ts.with_timezone(&Utc);
                        t0.get_or_insert(utc);
                        timestamp = Some(utc);
                    }
                }
                "speed" => speed = fit_value_to_f64(field.value()),
                "enhanced_speed" => enhanced_speed = fit_value_to_f64(field.value()),
                "position_lat" => lat = fit_value_to_f64(field.value()),
                "position_long" => lon = fit_value_to_f64(field.value()),
                "gps_accuracy" => accuracy = fit_value_to_f64(field.value()),
                _ => {}
            }
        }
        let (Some(utc), Some(base)) = (timestamp, t0) else {
            continue;
        };
        let position = match (lat, lon) {
            (Some(lat), Some(lon)) => {
                let mut p = Position::new(lat * SEMICIRCLES_TO_DEGREES, lon * SEMICIRCLES_TO_DEGREES);
                p.accuracy_m = accuracy;
                Some(p)
            }
            _ => None,
        };
        out.push(TrackPoint {
            t_s: (utc - base).num_milliseconds() as f64 / 1000.0,
            speed_mps: enhanced_speed.or(speed),
            position,
        });
    }

    Ok(out)
}

fn fit_value_to_f64(value: &fitparser::Value) -> Option<f64> {
    match value {
        fitparser::Value::Float32(v) => Some(*v as f64),
        fitparser::Value::Float64(v) => Some(*v),
        fitparser::Value::SInt8(v) => Some(*v as f64),
        fitparser::Value::UInt8(v) => Some(*v as f64),
        fitparser::Value::UInt8z(v) => Some(*v as f64),
        fitparser::Value::SInt16(v) => Some(*v as f64),
        fitparser::Value::UInt16(v) => Some(*v as f64),
        fitparser::Value::UInt16z(v) => Some(*v as f64),
        fitparser::Value::SInt32(v) => Some(*v as f64),
        fitparser::Value::UInt32(v) => Some(*v as f64),
        fitparser::Value::UInt32z(v) => Some(*v as f64),
        fitparser::Value::Array(values) => values.iter().find_map(fit_value_to_f64),
        _ => None,
    }
}

fn parse_gpx_points(input: &[u8]) -> Result<Vec<TrackPoint>, SpeedoError> {
    use gpx::read;
    use std::io::Cursor;

    let mut cursor = Cursor::new(input);
    let gpx = read(&mut cursor).map_err(|e| SpeedoError::GpxParse(e.to_string()))?;
    let mut out = Vec::new();
    let mut base: Option<DateTime<Utc>> = None;
    let mut skipped = 0usize;

    for track in gpx.tracks {
        for segment in track.segments {
            for point in segment.points {
                let Some(time) = point.time else {
                    skipped += 1;
                    continue;
                };
                let iso = time
                    .format()
                    .map_err(|e| SpeedoError::GpxParse(e.to_string()))?;
                let utc = DateTime::parse_from_rfc3339(&iso)
                    .map_err(|e| SpeedoError::GpxParse(e.to_string()))?
                    .with_timezone(&Utc);
                let base = *base.get_or_insert(utc);
                let geo = point.point();
                out.push(TrackPoint {
                    t_s: (utc - base).num_milliseconds() as f64 / 1000.0,
                    speed_mps: point.speed,
                    position: Some(Position::new(geo.y(), geo.x())),
                });
            }
        }
    }
    if skipped > 0 {
        warn!("Skipped {} GPX points without a timestamp", skipped);
    }
    Ok(out)
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    time_s: f64,
    speed_mps: Option<f64>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    accuracy_m: Option<f64>,
}

fn parse_csv_points(input: &[u8]) -> Result<Vec<TrackPoint>, SpeedoError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(input);
    let mut out = Vec::new();
    for row in reader.deserialize::<CsvRow>() {
        let row = row.map_err(|e| SpeedoError::CsvParse(e.to_string()))?;
        let position = match (row.lat, row.lon) {
            (Some(lat), Some(lon)) => {
                let mut p = Position::new(lat, lon);
                p.accuracy_m = row.accuracy_m;
                Some(p)
            }
            _ => None,
        };
        out.push(TrackPoint {
            t_s: row.time_s,
            speed_mps: row.speed_mps,
            position,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TrackingEngine;
    use crate::EngineConfig;

    fn samples(events: &[SourceEvent]) -> Vec<Sample> {
        events
            .iter()
            .filter_map(|e| match e {
                SourceEvent::Sample(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_scripted_speeds_track() {
        let start = Position::new(45.0, 5.0);
        let events = scripted_speeds(&[36.0, 36.0, 0.0], 1000, start);
        let s = samples(&events);
        assert_eq!(s.len(), 3);
        assert_eq!(s[1].timestamp_ns, 1_000_000_000);
        assert!((s[0].speed_mps - 10.0).abs() < 1e-9);

        let p0 = s[0].position.unwrap();
        let p1 = s[1].position.unwrap();
        let p2 = s[2].position.unwrap();
        let hop = haversine_distance_m(p0.latitude, p0.longitude, p1.latitude, p1.longitude);
        assert!((hop - 10.0).abs() < 1e-6);
        assert_eq!(p1.latitude, p2.latitude);
        assert_eq!(p2.longitude, 5.0);
    }

    #[test]
    fn test_parse_csv_rebases_and_derives_speed() {
        let csv = "time_s,speed_mps,lat,lon,accuracy_m\n\
                   100.0,,45.0,5.0,4\n\
                   101.5,3.0,45.0001,5.0,\n\
                   103.0,,45.0002,5.0,\n\
                   104.0,0.5,,,\n";
        let events = parse_events(csv.as_bytes(), "track.CSV").unwrap();
        let s = samples(&events);
        assert_eq!(s.len(), 4);
        assert_eq!(s[0].timestamp_ns, 0);
        assert_eq!(s[1].timestamp_ns, 1_500_000_000);
        assert_eq!(s[0].speed_mps, 0.0);
        assert_eq!(s[0].position.unwrap().accuracy_m, Some(4.0));
        assert_eq!(s[1].speed_mps, 3.0);
        let hop = haversine_distance_m(45.0001, 5.0, 45.0002, 5.0);
        assert!((s[2].speed_mps - hop / 1.5).abs() < 1e-9);
        assert!(s[3].position.is_none());
    }

    #[test]
    fn test_parse_csv_earliest_time_is_base() {
        let csv = "time_s,speed_mps\n5,1\n3,1\n";
        let s = samples(&parse_events(csv.as_bytes(), "csv").unwrap());
        assert_eq!(s[0].timestamp_ns, 2_000_000_000);
        assert_eq!(s[1].timestamp_ns, 0);
    }

    #[test]
    fn test_parse_events_errors() {
        assert!(matches!(
            parse_events(b"", "track.tcx"),
            Err(SpeedoError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            parse_events(b"time_s,speed_mps\nabc,1\n", "csv"),
            Err(SpeedoError::CsvParse(_))
        ));
        assert!(matches!(
            parse_events(b"time_s,speed_mps\n", "csv"),
            Err(SpeedoError::InsufficientData)
        ));
        assert!(matches!(
            parse_events(b"{", "json"),
            Err(SpeedoError::JsonParse(_))
        ));
    }

    #[test]
    fn test_parse_gpx_derives_speed() {
        let gpx = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="test" xmlns="http://www.topografix.com/GPX/1/1">
  <trk><trkseg>
    <trkpt lat="45.0" lon="5.0"><time>2024-05-01T10:00:00Z</time></trkpt>
    <trkpt lat="45.001" lon="5.0"><time>2024-05-01T10:00:10Z</time></trkpt>
  </trkseg></trk>
</gpx>"#;
        let s = samples(&parse_events(gpx.as_bytes(), "ride.gpx").unwrap());
        assert_eq!(s.len(), 2);
        assert_eq!(s[1].timestamp_ns, 10_000_000_000);
        let expected = haversine_distance_m(45.0, 5.0, 45.001, 5.0) / 10.0;
        assert!((s[1].speed_mps - expected).abs() < 1e-6);
    }

    #[test]
    fn test_parse_json_events() {
        let json = r#"[
            { "event": "provider_enabled" },
            { "event": "sample", "speed_mps": 4.0, "timestamp_ns": 0 }
        ]"#;
        let events = parse_events(json.as_bytes(), "json").unwrap();
        assert_eq!(events[0], SourceEvent::ProviderEnabled);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_summarize_events() {
        let events = vec![
            SourceEvent::ProviderEnabled,
            SourceEvent::Sample(Sample::at_seconds(0.5, 2.0)),
            SourceEvent::Sample(
                Sample::at_seconds(4.0, 5.0).with_position(Position::new(45.0, 5.0)),
            ),
            SourceEvent::Sample(Sample::at_seconds(2.0, 3.0)),
            SourceEvent::ProviderDisabled,
        ];
        let summary = summarize_events(&events, kmh_to_ms(5.0));
        assert_eq!(summary.samples, 3);
        assert_eq!(summary.lifecycle_events, 2);
        assert_eq!(summary.with_position, 1);
        assert_eq!(summary.moving, 2);
        assert_eq!(summary.out_of_order, 1);
        assert_eq!(summary.max_speed_mps, 4.0);
        assert!((summary.span_s - 3.0).abs() < 1e-9);

        assert_eq!(summarize_events(&[], 1.0), TrackSummary::default());
    }

    #[test]
    fn test_replay_holds_events_without_sink() {
        let source = ReplaySource::from_events(vec![SourceEvent::ProviderEnabled]);
        assert!(!source.is_delivering());
        assert_eq!(source.step(), None);
        assert_eq!(source.pending(), 1);
    }

    #[test]
    fn test_demo_profile_through_engine() {
        let source = Arc::new(ReplaySource::from_events(scripted_speeds(
            &DEMO_SPEEDS_KMH,
            1000,
            Position::new(45.0, 5.0),
        )));
        let engine = TrackingEngine::new(EngineConfig::default(), source.clone()).unwrap();
        assert!(engine.start_tracking());
        assert_eq!(source.drain(), DEMO_SPEEDS_KMH.len());

        let section = engine.last_section().unwrap();
        assert_eq!(section.time_elapsed_s, 12);
        assert!(!engine.is_speed_active());
        assert!(engine.last_section_average_speed() > 0);

        engine.stop_tracking();
        assert!(!source.is_delivering());
    }

    #[test]
    fn test_cancel_stops_delivery() {
        let source = Arc::new(ReplaySource::from_events(scripted_speeds(
            &[10.0, 10.0, 10.0],
            500,
            Position::new(0.0, 0.0),
        )));
        let engine = TrackingEngine::new(EngineConfig::default(), source.clone()).unwrap();
        assert!(engine.start_tracking());
        assert!(source.step().is_some());
        engine.stop_tracking();
        assert_eq!(source.drain(), 0);
        assert_eq!(source.pending(), 2);
    }
}
