//! Tracking lifecycle, moving/stationary activity and section bookkeeping.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::listeners::{
    ActivityListener, ListenerSet, SectionListener, SpeedListener, Subscription,
    TrackingStateListener,
};
use crate::sample::{ProviderStatus, Sample, SourceEvent};
use crate::section::{compute_section, Section};
use crate::{ms_to_kmh, EngineConfig, SpeedoError};

/// Delivery parameters handed to the source. The engine does not interpret them.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct UpdateRequest {
    pub interval_ms: u64,
    pub distance_m: f64,
}

/// Producer of location samples (GPS receiver, replay file, test script).
pub trait SampleSource: Send + Sync {
    /// Permission granted and provider enabled.
    fn is_ready(&self) -> bool;

    /// Start delivering samples and lifecycle events to `sink`. A new request
    /// replaces the previous sink.
    ///
    /// The registration must survive provider loss: after `ProviderDisabled`
    /// the source keeps the sink and resumes delivery once the provider comes
    /// back. The engine only requests again after `cancel_updates`.
    fn request_updates(&self, request: UpdateRequest, sink: Weak<dyn SampleSink>);

    fn cancel_updates(&self);
}

/// Callback surface through which a source feeds the engine.
pub trait SampleSink: Send + Sync {
    fn on_sample(&self, sample: Sample);
    fn on_provider_enabled(&self);
    fn on_provider_disabled(&self);
    fn on_status_changed(&self, status: ProviderStatus);

    fn on_event(&self, event: SourceEvent) {
        match event {
            SourceEvent::Sample(sample) => self.on_sample(sample),
            SourceEvent::ProviderEnabled => self.on_provider_enabled(),
            SourceEvent::ProviderDisabled => self.on_provider_disabled(),
            SourceEvent::StatusChanged { status } => self.on_status_changed(status),
        }
    }
}

#[derive(Debug, Default)]
struct EngineState {
    tracking_running: bool,
    updates_requested: bool,
    shut_down: bool,
    /// Sample at which the current moving section started.
    anchor: Option<Sample>,
    last_location: Option<Sample>,
    last_section: Option<Section>,
}

#[derive(Debug)]
enum Notification {
    Speed(i32, Sample),
    Activity(bool),
    TrackingState(bool),
    Section(Section),
}

pub struct TrackingEngine {
    config: EngineConfig,
    enter_speed_mps: f64,
    exit_speed_mps: f64,
    source: Arc<dyn SampleSource>,
    state: Mutex<EngineState>,
    speed_listeners: ListenerSet<dyn SpeedListener>,
    activity_listeners: ListenerSet<dyn ActivityListener>,
    tracking_listeners: ListenerSet<dyn TrackingStateListener>,
    section_listeners: ListenerSet<dyn SectionListener>,
    weak_self: Weak<TrackingEngine>,
}

impl TrackingEngine {
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn SampleSource>,
    ) -> Result<Arc<Self>, SpeedoError> {
        config.validate()?;
        let enter_speed_mps = config.min_speed_running_mps();
        let exit_speed_mps = config.exit_speed_mps();
        debug!(
            "Tracking engine created: enter {:.3} m/s, exit {:.3} m/s, model {:?}",
            enter_speed_mps, exit_speed_mps, config.distance_model
        );
        Ok(Arc::new_cyclic(|weak_self| Self {
            config,
            enter_speed_mps,
            exit_speed_mps,
            source,
            state: Mutex::new(EngineState::default()),
            speed_listeners: ListenerSet::new(),
            activity_listeners: ListenerSet::new(),
            tracking_listeners: ListenerSet::new(),
            section_listeners: ListenerSet::new(),
            weak_self: weak_self.clone(),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Threshold for entering the moving state, in m/s.
    pub fn min_speed_running_mps(&self) -> f64 {
        self.enter_speed_mps
    }

    pub fn update_request(&self) -> UpdateRequest {
        UpdateRequest {
            interval_ms: self.config.update_interval_ms,
            distance_m: self.config.update_distance_m,
        }
    }

    pub fn is_tracking_ready(&self) -> bool {
        self.source.is_ready()
    }

    pub fn is_tracking_running(&self) -> bool {
        self.lock().tracking_running
    }

    pub fn is_speed_active(&self) -> bool {
        self.lock().anchor.is_some()
    }

    /// Average speed of the last closed section in whole km/h, 0 before any.
    pub fn last_section_average_speed(&self) -> i32 {
        self.lock()
            .last_section
            .map(|section| section.rounded_average_kmh())
            .unwrap_or(0)
    }

    pub fn last_section(&self) -> Option<Section> {
        self.lock().last_section
    }

    pub fn last_location(&self) -> Option<Sample> {
        self.lock().last_location
    }

    pub fn format_speed(&self, kmh: f64) -> String {
        self.config.display.format_kmh(kmh)
    }

    /// Request sample delivery. Does nothing and returns `false` when the
    /// source is not ready or the engine was shut down.
    pub fn start_tracking(&self) -> bool {
        if self.lock().shut_down {
            warn!("start_tracking called after shutdown");
            return false;
        }
        if !self.is_tracking_ready() {
            debug!("Tracking not ready: permission or provider unavailable");
            return false;
        }
        let needs_request = !self.lock().updates_requested;
        if needs_request {
            let sink: Weak<dyn SampleSink> = self.weak_self.clone();
            self.source.request_updates(self.update_request(), sink);
        }
        let pending = {
            let mut state = self.lock();
            // shutdown may have run while the source was called unlocked
            if state.shut_down {
                None
            } else {
                state.updates_requested = true;
                let mut pending = Vec::new();
                set_tracking_running(&mut state, true, &mut pending);
                Some(pending)
            }
        };
        match pending {
            Some(pending) => {
                self.dispatch(pending);
                true
            }
            None => {
                warn!("Engine shut down while starting; cancelling updates");
                self.source.cancel_updates();
                false
            }
        }
    }

    /// Cancel sample delivery. Always cancels at the source; notifies only if
    /// tracking was running.
    pub fn stop_tracking(&self) {
        self.source.cancel_updates();
        let pending = {
            let mut state = self.lock();
            state.updates_requested = false;
            let mut pending = Vec::new();
            set_tracking_running(&mut state, false, &mut pending);
            pending
        };
        self.dispatch(pending);
    }

    /// Start when stopped, stop when running. Returns the new running state.
    pub fn toggle_tracking(&self) -> bool {
        if self.is_tracking_running() {
            self.stop_tracking();
        } else {
            self.start_tracking();
        }
        self.is_tracking_running()
    }

    /// Stop tracking, drop every listener and refuse further work.
    pub fn shutdown(&self) {
        self.stop_tracking();
        self.lock().shut_down = true;
        self.speed_listeners.clear();
        self.activity_listeners.clear();
        self.tracking_listeners.clear();
        self.section_listeners.clear();
        info!("Tracking engine shut down");
    }

    pub fn subscribe_speed(&self, listener: Arc<dyn SpeedListener>) -> Subscription {
        self.speed_listeners.register(listener)
    }

    pub fn unsubscribe_speed(&self, subscription: Subscription) -> bool {
        self.speed_listeners.unsubscribe(subscription)
    }

    pub fn subscribe_activity(&self, listener: Arc<dyn ActivityListener>) -> Subscription {
        self.activity_listeners.register(listener)
    }

    pub fn unsubscribe_activity(&self, subscription: Subscription) -> bool {
        self.activity_listeners.unsubscribe(subscription)
    }

    pub fn subscribe_tracking_state(
        &self,
        listener: Arc<dyn TrackingStateListener>,
    ) -> Subscription {
        self.tracking_listeners.register(listener)
    }

    pub fn unsubscribe_tracking_state(&self, subscription: Subscription) -> bool {
        self.tracking_listeners.unsubscribe(subscription)
    }

    pub fn subscribe_section(&self, listener: Arc<dyn SectionListener>) -> Subscription {
        self.section_listeners.register(listener)
    }

    pub fn unsubscribe_section(&self, subscription: Subscription) -> bool {
        self.section_listeners.unsubscribe(subscription)
    }

    pub fn speed_listeners(&self) -> &ListenerSet<dyn SpeedListener> {
        &self.speed_listeners
    }

    pub fn activity_listeners(&self) -> &ListenerSet<dyn ActivityListener> {
        &self.activity_listeners
    }

    pub fn tracking_listeners(&self) -> &ListenerSet<dyn TrackingStateListener> {
        &self.tracking_listeners
    }

    pub fn section_listeners(&self) -> &ListenerSet<dyn SectionListener> {
        &self.section_listeners
    }

    /// Close the open section against `closing` and clear the anchor.
    fn close_section(&self, state: &mut EngineState, closing: &Sample) -> Option<Section> {
        let anchor = state.anchor.take()?;
        let section = compute_section(&anchor, closing, self.config.distance_model);
        if section.is_degenerate() {
            warn!(
                "Section closed with no whole second elapsed ({} ns -> {} ns); average reported as 0",
                anchor.timestamp_ns, closing.timestamp_ns
            );
        }
        info!(
            "Section closed: {:.1} m in {} s, average {:.1} km/h",
            section.distance_m,
            section.time_elapsed_s,
            section.average_speed_kmh()
        );
        state.last_section = Some(section);
        Some(section)
    }

    /// Close any open section against the last known location because the
    /// provider went away, then mark tracking stopped.
    fn handle_provider_lost(&self, state: &mut EngineState, pending: &mut Vec<Notification>) {
        let mut closed = None;
        if let Some(anchor) = state.anchor {
            let closing = state.last_location.unwrap_or(anchor);
            closed = self.close_section(state, &closing);
        }
        if let Some(section) = closed {
            pending.push(Notification::Section(section));
        }
        set_tracking_running(state, false, pending);
        if closed.is_some() {
            pending.push(Notification::Activity(false));
        }
    }

    fn dispatch(&self, pending: Vec<Notification>) {
        for notification in pending {
            match notification {
                Notification::Speed(kmh, sample) => self
                    .speed_listeners
                    .notify(|l| l.on_speed_changed(kmh, &sample)),
                Notification::Activity(active) => self
                    .activity_listeners
                    .notify(|l| l.on_activity_changed(active)),
                Notification::TrackingState(running) => self
                    .tracking_listeners
                    .notify(|l| l.on_tracking_state_changed(running)),
                Notification::Section(section) => self
                    .section_listeners
                    .notify(|l| l.on_section_changed(&section)),
            }
        }
    }

    /// Runs `apply` on the state unless the engine was shut down, then
    /// dispatches whatever it queued.
    fn apply<F>(&self, update: F)
    where
        F: FnOnce(&mut EngineState, &mut Vec<Notification>),
    {
        let pending = {
            let mut state = self.lock();
            if state.shut_down {
                return;
            }
            let mut pending = Vec::new();
            update(&mut state, &mut pending);
            pending
        };
        self.dispatch(pending);
    }
}

fn set_tracking_running(state: &mut EngineState, running: bool, pending: &mut Vec<Notification>) {
    if state.tracking_running != running {
        state.tracking_running = running;
        info!("Tracking {}", if running { "started" } else { "stopped" });
        pending.push(Notification::TrackingState(running));
    }
}

impl SampleSink for TrackingEngine {
    fn on_sample(&self, sample: Sample) {
        debug!(
            "Sample: {:.2} m/s at {} ns, position {:?}",
            sample.speed_mps, sample.timestamp_ns, sample.position
        );
        self.apply(|state, pending| {
            if let Some(last) = state.last_location {
                if sample.timestamp_ns < last.timestamp_ns {
                    warn!(
                        "Out-of-order sample: {} ns after {} ns",
                        sample.timestamp_ns, last.timestamp_ns
                    );
                }
            }
            state.last_location = Some(sample);

            let speed = sample.speed();
            if state.anchor.is_none() {
                if speed >= self.enter_speed_mps {
                    state.anchor = Some(sample);
                    info!("Moving: {:.2} m/s >= {:.2} m/s", speed, self.enter_speed_mps);
                    pending.push(Notification::Activity(true));
                }
            } else if speed < self.exit_speed_mps {
                if let Some(section) = self.close_section(state, &sample) {
                    info!("Stationary: {:.2} m/s < {:.2} m/s", speed, self.exit_speed_mps);
                    pending.push(Notification::Activity(false));
                    pending.push(Notification::Section(section));
                }
            }

            pending.push(Notification::Speed(ms_to_kmh(speed), sample));
        });
    }

    fn on_provider_enabled(&self) {
        debug!("Provider enabled");
        self.apply(|state, pending| set_tracking_running(state, true, pending));
    }

    fn on_provider_disabled(&self) {
        debug!("Provider disabled");
        self.apply(|state, pending| self.handle_provider_lost(state, pending));
    }

    fn on_status_changed(&self, status: ProviderStatus) {
        debug!("Provider status changed: {:?}", status);
        self.apply(|state, pending| {
            if status.is_available() {
                set_tracking_running(state, true, pending);
            } else {
                self.handle_provider_lost(state, pending);
            }
        });
    }
}
