//! Loaded/unloaded classification strategies.
//!
//! A policy correlates the server's reply packets with the probe at the head
//! of a connection's in-flight queue. It never touches connection state
//! directly; it returns a [`Verdict`] and the connection acts on it.
//!
//! Policies are selected by name from a fixed registry built at compile time:
//!
//! | Name            | Behaviour                                                      |
//! |-----------------|----------------------------------------------------------------|
//! | `close-window`  | loaded iff a close for the probe's window precedes the correction |
//! | `strict-window` | as above, but the open for the predicted window must be seen first |

use crate::connection::{previous_window_id, ProcessingProbe};
use crate::error::ProbeError;
use crate::protocol::Inbound;
use log::warn;

pub const DEFAULT_POLICY: &str = "close-window";

/// What the connection knows that a policy may consult.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext {
    /// The storage session is currently open (as last reported by the server).
    pub storage_open: bool,
    /// Probes carry a predicted window id.
    pub tracks_windows: bool,
    /// Every probe opens the storage itself.
    pub arzi_mode: bool,
}

impl PolicyContext {
    /// Opens are probe boundaries whenever each probe sends its own.
    fn opens_per_probe(&self) -> bool {
        self.tracks_windows || self.arzi_mode
    }
}

/// Which sequence counter a contradiction was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesyncKind {
    Teleport { observed: i32 },
    Window,
}

/// Result of feeding one event to a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Not enough signals yet.
    Pending,
    Loaded,
    Unloaded,
    /// This probe cannot be classified; hand it back, keep the rest.
    RescheduleCurrent,
    /// Ordering with the server is broken; every in-flight probe goes back.
    Desync(DesyncKind),
}

/// A replaceable correlation strategy.
pub trait ClassificationPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether `event` starts classification of the next queued probe when
    /// no probe is current.
    fn claims(&self, event: &Inbound, ctx: &PolicyContext) -> bool;

    /// Feed `event` (already counted in `probe.packets_elapsed`).
    fn observe(&self, probe: &mut ProcessingProbe, event: &Inbound, ctx: &PolicyContext) -> Verdict;
}

// ---------------------------------------------------------------------------
// Shared pieces
// ---------------------------------------------------------------------------

fn claims_boundary(event: &Inbound, ctx: &PolicyContext) -> bool {
    match event {
        Inbound::PositionCorrection { .. } | Inbound::ContainerClosed { .. } => true,
        Inbound::ContainerOpened { .. } => ctx.opens_per_probe(),
        _ => false,
    }
}

/// Window contents for the probe's own window are a consequence of the open,
/// not a reply to the probe.
fn discount_window_traffic(probe: &mut ProcessingProbe, event: &Inbound) {
    let window_id = match event {
        Inbound::ContainerItems { window_id } | Inbound::ContainerProperty { window_id } => *window_id,
        _ => return,
    };
    if probe.open_window_id == Some(window_id) {
        probe.packets_elapsed = probe.packets_elapsed.saturating_sub(1);
    }
}

enum CloseMatch {
    Ours,
    Superseded,
    Foreign,
}

fn match_close(probe: &ProcessingProbe, window_id: i32, ctx: &PolicyContext) -> CloseMatch {
    match probe.window_id {
        // Without a prediction, only the window this probe opened can be ours.
        None if ctx.arzi_mode => match probe.open_window_id {
            Some(opened) if opened == window_id => CloseMatch::Ours,
            Some(_) => CloseMatch::Foreign,
            None => CloseMatch::Superseded,
        },
        None => CloseMatch::Ours,
        Some(expected) if expected == window_id => CloseMatch::Ours,
        Some(expected) if previous_window_id(expected) == window_id => CloseMatch::Superseded,
        Some(_) => CloseMatch::Foreign,
    }
}

/// Classification once the correction matched the probe's teleport id.
fn classify_by_close(probe: &ProcessingProbe, ctx: &PolicyContext) -> Verdict {
    if probe.close_window_id.is_some() {
        Verdict::Loaded
    } else if ctx.storage_open {
        Verdict::Unloaded
    } else {
        // The storage was not open while the move was processed, so the
        // absence of a close says nothing.
        Verdict::RescheduleCurrent
    }
}

// ---------------------------------------------------------------------------
// close-window
// ---------------------------------------------------------------------------

/// Loaded iff the storage session was closed before the correction arrived.
#[derive(Debug, Default)]
pub struct CloseWindowPolicy;

impl ClassificationPolicy for CloseWindowPolicy {
    fn name(&self) -> &'static str {
        "close-window"
    }

    fn claims(&self, event: &Inbound, ctx: &PolicyContext) -> bool {
        claims_boundary(event, ctx)
    }

    fn observe(&self, probe: &mut ProcessingProbe, event: &Inbound, ctx: &PolicyContext) -> Verdict {
        match event {
            Inbound::ContainerOpened { window_id } if ctx.opens_per_probe() => {
                if probe.open_window_id.is_some() {
                    // Second open before the correction: a movement packet was dropped.
                    return Verdict::Desync(DesyncKind::Window);
                }
                probe.open_window_id = Some(*window_id);
                match probe.window_id {
                    Some(expected) if expected != *window_id => Verdict::Desync(DesyncKind::Window),
                    _ => Verdict::Pending,
                }
            }
            Inbound::ContainerItems { .. } | Inbound::ContainerProperty { .. } => {
                discount_window_traffic(probe, event);
                Verdict::Pending
            }
            Inbound::ContainerClosed { window_id } => {
                if let Some(seen) = probe.close_window_id {
                    warn!(
                        "extra close window {} for probe at {} (already closed {})",
                        window_id,
                        probe.query.position(),
                        seen
                    );
                    return Verdict::Pending;
                }
                match match_close(probe, *window_id, ctx) {
                    CloseMatch::Ours => {
                        probe.close_window_id = Some(*window_id);
                        Verdict::Pending
                    }
                    CloseMatch::Superseded => Verdict::Pending,
                    CloseMatch::Foreign => Verdict::Desync(DesyncKind::Window),
                }
            }
            Inbound::PositionCorrection { teleport_id, .. } => {
                if *teleport_id != probe.teleport_id {
                    return Verdict::Desync(DesyncKind::Teleport {
                        observed: *teleport_id,
                    });
                }
                classify_by_close(probe, ctx)
            }
            _ => Verdict::Pending,
        }
    }
}

// ---------------------------------------------------------------------------
// strict-window
// ---------------------------------------------------------------------------

/// Like [`CloseWindowPolicy`], but every link of the open → (close) →
/// correction chain must be present and carry the predicted window id.
#[derive(Debug, Default)]
pub struct StrictWindowPolicy;

impl ClassificationPolicy for StrictWindowPolicy {
    fn name(&self) -> &'static str {
        "strict-window"
    }

    fn claims(&self, event: &Inbound, ctx: &PolicyContext) -> bool {
        claims_boundary(event, ctx)
    }

    fn observe(&self, probe: &mut ProcessingProbe, event: &Inbound, ctx: &PolicyContext) -> Verdict {
        match event {
            Inbound::ContainerOpened { window_id } if ctx.opens_per_probe() => {
                let mispredicted = probe.window_id.is_some_and(|expected| expected != *window_id);
                if probe.open_window_id.is_some() || mispredicted {
                    return Verdict::Desync(DesyncKind::Window);
                }
                probe.open_window_id = Some(*window_id);
                Verdict::Pending
            }
            Inbound::ContainerItems { .. } | Inbound::ContainerProperty { .. } => {
                discount_window_traffic(probe, event);
                Verdict::Pending
            }
            Inbound::ContainerClosed { window_id } => {
                if probe.close_window_id.is_some() {
                    return Verdict::Desync(DesyncKind::Window);
                }
                match match_close(probe, *window_id, ctx) {
                    CloseMatch::Ours => {
                        if probe.window_id.is_some() && probe.open_window_id.is_none() {
                            return Verdict::Desync(DesyncKind::Window);
                        }
                        probe.close_window_id = Some(*window_id);
                        Verdict::Pending
                    }
                    CloseMatch::Superseded => Verdict::Pending,
                    CloseMatch::Foreign => Verdict::Desync(DesyncKind::Window),
                }
            }
            Inbound::PositionCorrection { teleport_id, .. } => {
                if *teleport_id != probe.teleport_id {
                    return Verdict::Desync(DesyncKind::Teleport {
                        observed: *teleport_id,
                    });
                }
                match probe.window_id {
                    Some(expected) => {
                        if probe.open_window_id != Some(expected) {
                            Verdict::Desync(DesyncKind::Window)
                        } else if probe.close_window_id == Some(expected) {
                            Verdict::Loaded
                        } else {
                            Verdict::Unloaded
                        }
                    }
                    None if ctx.arzi_mode && probe.open_window_id.is_none() => {
                        Verdict::Desync(DesyncKind::Window)
                    }
                    None => classify_by_close(probe, ctx),
                }
            }
            _ => Verdict::Pending,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub type PolicyFactory = fn() -> Box<dyn ClassificationPolicy>;

fn close_window() -> Box<dyn ClassificationPolicy> {
    Box::new(CloseWindowPolicy)
}

fn strict_window() -> Box<dyn ClassificationPolicy> {
    Box::new(StrictWindowPolicy)
}

static REGISTRY: &[(&str, PolicyFactory)] = &[
    ("close-window", close_window),
    ("strict-window", strict_window),
];

pub fn lookup(name: &str) -> Option<PolicyFactory> {
    REGISTRY
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, factory)| *factory)
}

pub fn names() -> Vec<&'static str> {
    REGISTRY.iter().map(|(n, _)| *n).collect()
}

/// Build the policy registered under `name`.
pub fn build(name: &str) -> Result<Box<dyn ClassificationPolicy>, ProbeError> {
    lookup(name)
        .map(|factory| factory())
        .ok_or_else(|| ProbeError::UnknownPolicy(name.to_string()))
}
