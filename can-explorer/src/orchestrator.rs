//! Fetch orchestrator
//!
//! The coordination core. Owns the window, the live DBC, the offsets and the
//! message store, and decides which worker to run next. It never runs a
//! worker itself: every transition returns the [`Action`]s the driver must
//! execute, and every worker result comes back through one of the `on_*`
//! methods.
//!
//! # Generations
//!
//! A [`GenerationStamp`] is `(epoch, window, dbc_epoch)`. The epoch is bumped
//! whenever the store is reset (window change or DBC swap). Each part request
//! carries the stamp it was issued under, by value; a result whose stamp no
//! longer matches the live one is discarded without merging and the chain it
//! belonged to ends there. In-flight workers are never cancelled.
//!
//! # Chain
//!
//! `Idle -> ResolvingOffsets -> FetchingPart(k) -> ... -> Done`. One part is
//! in flight per generation; part `k + 1` is requested only after part `k`
//! merged, so entries are appended in part order.

use crate::config::ExplorerConfig;
use crate::signals::{Dbc, Frame, Signal};
use crate::store::MessageStore;
use crate::types::{Message, MessageKey, Offsets, Result, Route, Window};
use crate::workers::{OffsetRequest, PartRequest, PartResult, RedecodeRequest};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of the data the store currently holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenerationStamp {
    pub epoch: u64,
    pub window: Window,
    pub dbc_epoch: u64,
}

/// A worker result classified against the live generation
#[derive(Debug, Clone, PartialEq)]
pub enum Freshness<T> {
    Fresh(T),
    Stale(T),
}

impl GenerationStamp {
    pub fn classify<T>(self, live: GenerationStamp, value: T) -> Freshness<T> {
        if self == live {
            Freshness::Fresh(value)
        } else {
            Freshness::Stale(value)
        }
    }
}

/// Progress of the fetch chain for the live generation
#[derive(Debug, Clone, PartialEq)]
pub enum ChainState {
    /// Nothing started yet
    Idle,
    /// Waiting for the offset resolver
    ResolvingOffsets,
    /// Part `k` is in flight
    FetchingPart(u32),
    /// Every part of the window is merged
    Done,
    /// Part `k` was abandoned by the supervisor
    Stalled(u32),
    /// Offsets could not be resolved; no part will be fetched
    Failed(String),
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainState::Idle => write!(f, "idle"),
            ChainState::ResolvingOffsets => write!(f, "resolving offsets"),
            ChainState::FetchingPart(part) => write!(f, "fetching part {}", part),
            ChainState::Done => write!(f, "done"),
            ChainState::Stalled(part) => write!(f, "stalled at part {}", part),
            ChainState::Failed(reason) => write!(f, "cannot load route: {}", reason),
        }
    }
}

/// Identifies which edit a re-decode result belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedecodeTicket {
    pub epoch: u64,
    pub key: MessageKey,
    pub signal_version: u64,
    /// Entries the re-decode request covered
    pub entry_count: usize,
    /// Undecoded frames the re-decode request covered
    pub undecoded_count: usize,
}

/// Work the driver must start
#[derive(Debug, Clone)]
pub enum Action {
    ResolveOffsets(OffsetRequest),
    FetchPart { stamp: GenerationStamp, request: PartRequest },
    Redecode { ticket: RedecodeTicket, request: RedecodeRequest },
}

/// Snapshot published to consumers
#[derive(Debug, Clone)]
pub struct StoreView {
    pub generation: GenerationStamp,
    pub window: Window,
    pub part_count: u32,
    pub chain: ChainState,
    pub offsets: Option<Offsets>,
    pub messages: BTreeMap<MessageKey, Message>,
    pub merged_parts: Vec<u32>,
    pub selected: Option<MessageKey>,
    pub editing: Option<MessageKey>,
    pub seek_index: usize,
    pub seek_time: f64,
    pub dbc_filename: String,
    pub dbc_last_saved: Option<DateTime<Utc>>,
}

impl StoreView {
    /// True once nothing more will load for this generation without a
    /// new request
    pub fn is_settled(&self) -> bool {
        matches!(self.chain, ChainState::Done | ChainState::Stalled(_) | ChainState::Failed(_))
    }

    pub fn entry_count(&self) -> usize {
        self.messages.values().map(|m| m.entries.len()).sum()
    }
}

/// The fetch orchestrator
pub struct Orchestrator {
    config: ExplorerConfig,
    route: Route,
    window: Window,
    dbc: Dbc,
    dbc_filename: String,
    dbc_last_saved: Option<DateTime<Utc>>,
    epoch: u64,
    dbc_epoch: u64,
    offsets: Option<Offsets>,
    chain: ChainState,
    store: MessageStore,
    selected: Option<MessageKey>,
    editing: Option<MessageKey>,
    seek_index: usize,
    seek_time: f64,
}

impl Orchestrator {
    /// Create an orchestrator for a route, starting on the initial window
    pub fn new(route: Route, dbc: Dbc, dbc_filename: impl Into<String>, config: ExplorerConfig) -> Result<Self> {
        let window = Window::initial(config.initial_span, route.part_count)?;
        Ok(Self {
            config,
            route,
            window,
            dbc,
            dbc_filename: dbc_filename.into(),
            dbc_last_saved: None,
            epoch: 0,
            dbc_epoch: 0,
            offsets: None,
            chain: ChainState::Idle,
            store: MessageStore::new(),
            selected: None,
            editing: None,
            seek_index: 0,
            seek_time: 0.0,
        })
    }

    /// Begin offset resolution for the route
    ///
    /// Also retries a failed resolution. Does nothing once offsets are known.
    pub fn start(&mut self) -> Vec<Action> {
        if self.offsets.is_some() || self.chain == ChainState::ResolvingOffsets {
            return Vec::new();
        }
        log::info!("Loading route {} ({} parts)", self.route.url, self.route.part_count);
        self.chain = ChainState::ResolvingOffsets;
        vec![Action::ResolveOffsets(OffsetRequest {
            part_count: self.route.part_count,
            base: self.route.url.clone(),
        })]
    }

    /// Offset resolver finished
    pub fn on_offsets(&mut self, result: Result<Offsets>) -> Vec<Action> {
        match result {
            Ok(offsets) => {
                self.offsets = Some(offsets);
                if self.chain == ChainState::ResolvingOffsets {
                    vec![self.fetch_chain(self.window.min_part)]
                } else {
                    Vec::new()
                }
            }
            Err(e) => {
                log::error!("Cannot load route {}: {}", self.route.url, e);
                self.chain = ChainState::Failed(e.to_string());
                Vec::new()
            }
        }
    }

    /// Live generation stamp
    pub fn generation(&self) -> GenerationStamp {
        GenerationStamp {
            epoch: self.epoch,
            window: self.window,
            dbc_epoch: self.dbc_epoch,
        }
    }

    /// Request part `part` of the live generation
    fn fetch_chain(&mut self, part: u32) -> Action {
        let start_time = self.offsets.map(|o| o.first_frame_time).unwrap_or(0.0);
        self.chain = ChainState::FetchingPart(part);
        log::debug!("Fetching part {} of window {} (epoch {})", part, self.window, self.epoch);
        Action::FetchPart {
            stamp: self.generation(),
            request: PartRequest {
                dbc_text: self.dbc.to_dbc_text(),
                base: self.route.url.clone(),
                part,
                start_time,
                signal_versions: self.dbc.signal_versions(),
            },
        }
    }

    /// Part worker finished
    pub fn on_part(&mut self, stamp: GenerationStamp, result: PartResult) -> Vec<Action> {
        let result = match stamp.classify(self.generation(), result) {
            Freshness::Fresh(result) => result,
            Freshness::Stale(result) => {
                log::debug!(
                    "Discarding stale part {} (epoch {}, live epoch {})",
                    result.part,
                    stamp.epoch,
                    self.epoch
                );
                return Vec::new();
            }
        };

        let part = result.part;
        let awaited = matches!(self.chain, ChainState::FetchingPart(p) | ChainState::Stalled(p) if p == part);
        self.store.merge_part(result, &self.dbc);

        if !awaited {
            return Vec::new();
        }
        self.continue_after(part)
    }

    /// Next step of the chain once `part` is merged
    fn continue_after(&mut self, part: u32) -> Vec<Action> {
        match self.next_unmerged(part + 1) {
            Some(next) => vec![self.fetch_chain(next)],
            None => {
                log::info!(
                    "Window {} loaded: {} messages",
                    self.window,
                    self.store.len()
                );
                self.chain = ChainState::Done;
                Vec::new()
            }
        }
    }

    fn next_unmerged(&self, from: u32) -> Option<u32> {
        (from.max(self.window.min_part)..=self.window.max_part).find(|p| !self.store.is_merged(*p))
    }

    /// The supervisor gave up on `part`
    pub fn on_part_abandoned(&mut self, stamp: GenerationStamp, part: u32) {
        if stamp != self.generation() {
            return;
        }
        if self.chain == ChainState::FetchingPart(part) {
            log::warn!("Chain stalled at part {} of window {}", part, self.window);
            self.chain = ChainState::Stalled(part);
        }
    }

    /// Resume the live generation from its first unmerged part
    ///
    /// Safe to call at any time: merged parts are skipped and a repeat merge
    /// is a no-op. Before offsets are known this retries resolution.
    pub fn restart_chain(&mut self) -> Vec<Action> {
        if self.offsets.is_none() {
            if matches!(self.chain, ChainState::Failed(_) | ChainState::Idle) {
                self.chain = ChainState::Idle;
                return self.start();
            }
            return Vec::new();
        }
        match self.next_unmerged(self.window.min_part) {
            Some(part) => vec![self.fetch_chain(part)],
            None => {
                self.chain = ChainState::Done;
                Vec::new()
            }
        }
    }

    /// Start a new generation: empty store, no selection, bumped epoch
    fn reset_generation(&mut self) -> Vec<Action> {
        self.epoch += 1;
        self.store.reset();
        self.selected = None;
        self.editing = None;

        if self.offsets.is_some() {
            vec![self.fetch_chain(self.window.min_part)]
        } else {
            // The chain starts once offsets resolve (or never, if they fail)
            Vec::new()
        }
    }

    /// Move the window to start at `start_part`, keeping its span
    pub fn change_window(&mut self, start_part: u32) -> Result<Vec<Action>> {
        let window = self.window.moved_to(start_part, self.route.part_count)?;
        log::info!("Window {} -> {}", self.window, window);
        self.window = window;
        Ok(self.reset_generation())
    }

    /// Replace the live DBC
    pub fn swap_dbc(&mut self, filename: impl Into<String>, dbc: Dbc) -> Result<Vec<Action>> {
        let window = Window::initial(self.config.initial_span, self.route.part_count)?;
        self.dbc = dbc;
        self.dbc_filename = filename.into();
        self.dbc_epoch += 1;
        self.window = window;
        log::info!("Loaded DBC {} ({} frames)", self.dbc_filename, self.dbc.stats().num_frames);
        Ok(self.reset_generation())
    }

    /// Write a new signal set for a message's address and re-decode it
    ///
    /// Every stored message with that address (on any bus) gets a re-decode.
    /// Their signals change only when the re-decoded entries arrive. A
    /// signal set the DBC cannot hold is rejected and changes nothing.
    pub fn commit_signal_edit(&mut self, key: MessageKey, signals: Vec<Signal>) -> Result<Vec<Action>> {
        let address = key.address;
        self.dbc.set_signals(address, signals)?;
        let signal_version = self.dbc.signal_version(address);
        let dbc_text = self.dbc.to_dbc_text();

        Ok(self
            .store
            .keys_for_address(address)
            .into_iter()
            .filter_map(|key| self.store.get(&key))
            .map(|message| Action::Redecode {
                ticket: RedecodeTicket {
                    epoch: self.epoch,
                    key: message.key,
                    signal_version,
                    entry_count: message.entries.len(),
                    undecoded_count: message.undecoded.len(),
                },
                request: RedecodeRequest {
                    message: message.clone(),
                    dbc_text: dbc_text.clone(),
                },
            })
            .collect())
    }

    /// Re-decode worker finished
    ///
    /// Applied only if the store was not reset and no newer edit of the same
    /// address was committed since the ticket was issued.
    pub fn on_redecoded(&mut self, ticket: RedecodeTicket, message: Message) -> bool {
        if ticket.epoch != self.epoch {
            log::debug!("Discarding re-decode of {} from epoch {}", ticket.key, ticket.epoch);
            return false;
        }
        if ticket.signal_version != self.dbc.signal_version(ticket.key.address) {
            log::debug!("Discarding re-decode of {}: superseded by a newer edit", ticket.key);
            return false;
        }
        self.store.apply_redecoded(
            message,
            (ticket.entry_count, ticket.undecoded_count),
            ticket.signal_version,
        )
    }

    /// Select a message, aligning the seek position to its entries
    pub fn select_message(&mut self, key: MessageKey) {
        if let Some(message) = self.store.get(&key) {
            if self.seek_time > 0.0 {
                let index = message.entry_index_at(self.seek_time).unwrap_or(0);
                self.seek_index = index;
                if let Some(entry) = message.entries.get(index) {
                    self.seek_time = entry.relative_time;
                }
            }
        }
        self.selected = Some(key);
    }

    pub fn seek(&mut self, index: usize, time: f64) {
        self.seek_index = index;
        self.seek_time = time;
    }

    /// Open a message for editing, synthesising a frame if it has none
    pub fn begin_edit(&mut self, key: MessageKey) -> Option<Frame> {
        let default_frame = self.dbc.create_frame(key.address);
        let message = self.store.get_mut(&key)?;
        let frame = message.frame.get_or_insert(default_frame).clone();
        self.editing = Some(key);
        Some(frame)
    }

    /// Replace a message's frame metadata after a frame edit
    pub fn set_message_frame(&mut self, key: MessageKey, frame: Frame) {
        if let Some(message) = self.store.get_mut(&key) {
            message.frame = Some(frame);
        }
        if self.editing == Some(key) {
            self.editing = None;
        }
    }

    /// Record a completed save of the live DBC
    pub fn mark_saved(&mut self, filename: impl Into<String>, at: DateTime<Utc>) {
        self.dbc_filename = filename.into();
        self.dbc_last_saved = Some(at);
    }

    pub fn dbc(&self) -> &Dbc {
        &self.dbc
    }

    pub fn dbc_filename(&self) -> &str {
        &self.dbc_filename
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn window(&self) -> Window {
        self.window
    }

    pub fn chain_state(&self) -> &ChainState {
        &self.chain
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn config(&self) -> &ExplorerConfig {
        &self.config
    }

    /// Snapshot for consumers
    pub fn view(&self) -> StoreView {
        StoreView {
            generation: self.generation(),
            window: self.window,
            part_count: self.route.part_count,
            chain: self.chain.clone(),
            offsets: self.offsets,
            messages: self.store.messages().clone(),
            merged_parts: self.store.merged_parts().iter().copied().collect(),
            selected: self.selected,
            editing: self.editing,
            seek_index: self.seek_index,
            seek_time: self.seek_time,
            dbc_filename: self.dbc_filename.clone(),
            dbc_last_saved: self.dbc_last_saved,
        }
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("route", &self.route)
            .field("generation", &self.generation())
            .field("chain", &self.chain)
            .field("messages", &self.store.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::SegmentWriter;
    use crate::types::ExplorerError;
    use crate::source::MemoryPartSource;
    use crate::workers::{fetch_decode_part, redecode_message};
    use std::sync::Arc;

    const SECOND: u64 = 1_000_000_000;

    /// Five parts; part `p` holds two 0x201 frames and one 0x300 frame
    fn source() -> MemoryPartSource {
        let mut source = MemoryPartSource::new();
        for p in 0..5u64 {
            let t = (p * 10 + 1) * SECOND;
            let segment = SegmentWriter::new()
                .frame(t, 0, 0x201, &[p as u8, 1])
                .frame(t + SECOND / 2, 0, 0x300, &[p as u8])
                .frame(t + SECOND, 0, 0x201, &[p as u8, 2])
                .finish();
            source = source.with_part(p as u32, segment);
        }
        source
    }

    fn dbc() -> Dbc {
        let mut dbc = Dbc::new();
        dbc.set_signals(0x201, vec![Signal::new("Part", 0, 8), Signal::new("Seq", 8, 8)]).unwrap();
        dbc
    }

    fn route() -> Route {
        Route { url: "mem://route".to_string(), part_count: 5 }
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(route(), dbc(), "test.dbc", ExplorerConfig::default()).unwrap()
    }

    fn offsets() -> Offsets {
        Offsets { frame_offset: 0, first_frame_time: 1.0 }
    }

    /// Run a fetch action synchronously
    fn run_fetch(source: &MemoryPartSource, action: &Action) -> (GenerationStamp, PartResult) {
        match action {
            Action::FetchPart { stamp, request } => (*stamp, fetch_decode_part(source, request).unwrap()),
            other => panic!("expected a fetch, got {:?}", other),
        }
    }

    fn single(actions: Vec<Action>) -> Action {
        assert_eq!(actions.len(), 1, "expected exactly one action");
        actions.into_iter().next().unwrap()
    }

    fn started(orch: &mut Orchestrator) -> Action {
        assert!(matches!(single(orch.start()), Action::ResolveOffsets(_)));
        single(orch.on_offsets(Ok(offsets())))
    }

    fn times(orch: &Orchestrator, key: MessageKey) -> Vec<f64> {
        orch.store().get(&key).unwrap().entries.iter().map(|e| e.relative_time).collect()
    }

    #[test]
    fn test_full_window_chain() {
        let source = source();
        let mut orch = orchestrator();
        let mut action = started(&mut orch);

        let mut fetched = Vec::new();
        loop {
            let (stamp, result) = run_fetch(&source, &action);
            fetched.push(result.part);
            let mut next = orch.on_part(stamp, result);
            if next.is_empty() {
                break;
            }
            action = next.remove(0);
        }

        assert_eq!(fetched, vec![0, 1, 2]);
        assert_eq!(*orch.chain_state(), ChainState::Done);

        let key = MessageKey::new(0, 0x201);
        assert_eq!(times(&orch, key), vec![0.0, 1.0, 10.0, 11.0, 20.0, 21.0]);
        assert_eq!(orch.store().get(&MessageKey::new(0, 0x300)).unwrap().entries.len(), 3);
        assert_eq!(orch.view().entry_count(), 9);
    }

    #[test]
    fn test_no_fetch_before_offsets() {
        let mut orch = orchestrator();
        orch.start();
        assert!(orch.change_window(1).unwrap().is_empty());
        assert_eq!(*orch.chain_state(), ChainState::ResolvingOffsets);

        // Chain starts on the moved window once offsets arrive
        match single(orch.on_offsets(Ok(offsets()))) {
            Action::FetchPart { request, stamp } => {
                assert_eq!(request.part, 1);
                assert_eq!(stamp.window, Window::new(1, 3));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_resolution_failure_starts_nothing() {
        let mut orch = orchestrator();
        orch.start();
        let actions = orch.on_offsets(Err(ExplorerError::OffsetResolution("404".to_string())));
        assert!(actions.is_empty());
        assert!(matches!(orch.chain_state(), ChainState::Failed(_)));
        assert!(orch.view().is_settled());

        // A DBC swap does not sneak a chain past the failure
        assert!(orch.swap_dbc("other.dbc", dbc()).unwrap().is_empty());

        // Restart retries resolution
        assert!(matches!(single(orch.restart_chain()), Action::ResolveOffsets(_)));
    }

    #[test]
    fn test_window_change_mid_chain_discards_stale_part() {
        let source = source();
        let mut orch = orchestrator();

        let a0 = started(&mut orch);
        let (s0, r0) = run_fetch(&source, &a0);
        let a1 = single(orch.on_part(s0, r0));
        let (s1, r1) = run_fetch(&source, &a1);
        let a2 = single(orch.on_part(s1, r1));

        // Part 2 in flight; the window moves to [1, 3]
        let fresh = single(orch.change_window(1).unwrap());
        assert_eq!(orch.window(), Window::new(1, 3));
        assert!(orch.store().is_empty());

        let (s2, r2) = run_fetch(&source, &a2);
        assert!(orch.on_part(s2, r2).is_empty());
        assert!(orch.store().is_empty());

        // Fresh chain over [1, 3]
        let mut action = fresh;
        loop {
            let (stamp, result) = run_fetch(&source, &action);
            let mut next = orch.on_part(stamp, result);
            if next.is_empty() {
                break;
            }
            action = next.remove(0);
        }

        assert_eq!(*orch.chain_state(), ChainState::Done);
        assert_eq!(orch.store().merged_parts().iter().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(
            times(&orch, MessageKey::new(0, 0x201)),
            vec![10.0, 11.0, 20.0, 21.0, 30.0, 31.0]
        );
    }

    #[test]
    fn test_dbc_swap_discards_previous_results() {
        let source = source();
        let mut orch = orchestrator();

        let a0 = started(&mut orch);
        let old_stamp = orch.generation();

        let mut renamed = Dbc::new();
        renamed.set_signals(0x201, vec![Signal::new("Whole", 0, 16)]).unwrap();
        let fresh = single(orch.swap_dbc("renamed.dbc", renamed).unwrap());
        assert_ne!(orch.generation(), old_stamp);
        assert_eq!(orch.window(), Window::new(0, 2));

        let (s0, r0) = run_fetch(&source, &a0);
        assert!(orch.on_part(s0, r0).is_empty());
        assert!(orch.store().is_empty());

        let (stamp, result) = run_fetch(&source, &fresh);
        orch.on_part(stamp, result);
        let message = orch.store().get(&MessageKey::new(0, 0x201)).unwrap();
        assert_eq!(message.signals[0].name, "Whole");
        assert!(message.entries.iter().all(|e| e.values.contains_key("Whole")));
        assert_eq!(orch.view().dbc_filename, "renamed.dbc");
    }

    #[test]
    fn test_window_change_clamps_and_keeps_span() {
        let mut orch = orchestrator();
        orch.start();
        orch.on_offsets(Ok(offsets()));
        orch.change_window(4).unwrap();
        assert_eq!(orch.window(), Window::new(2, 4));
    }

    #[test]
    fn test_repeat_delivery_does_not_duplicate_or_fork_chain() {
        let source = source();
        let mut orch = orchestrator();
        let a0 = started(&mut orch);
        let (s0, r0) = run_fetch(&source, &a0);

        assert_eq!(orch.on_part(s0, r0.clone()).len(), 1);
        assert!(orch.on_part(s0, r0).is_empty());
        assert_eq!(times(&orch, MessageKey::new(0, 0x201)), vec![0.0, 1.0]);
    }

    #[test]
    fn test_restart_after_stall_resumes_at_unmerged_part() {
        let source = source();
        let mut orch = orchestrator();
        let a0 = started(&mut orch);
        let (s0, r0) = run_fetch(&source, &a0);
        let a1 = single(orch.on_part(s0, r0));
        let (s1, _) = match &a1 {
            Action::FetchPart { stamp, request } => (*stamp, request.part),
            _ => unreachable!(),
        };

        orch.on_part_abandoned(s1, 1);
        assert_eq!(*orch.chain_state(), ChainState::Stalled(1));

        match single(orch.restart_chain()) {
            Action::FetchPart { request, .. } => assert_eq!(request.part, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_late_result_for_stalled_part_resumes_chain() {
        let source = source();
        let mut orch = orchestrator();
        let a0 = started(&mut orch);
        let (s0, r0) = run_fetch(&source, &a0);
        orch.on_part_abandoned(s0, 0);

        match single(orch.on_part(s0, r0)) {
            Action::FetchPart { request, .. } => assert_eq!(request.part, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    fn redecode(action: Action) -> (RedecodeTicket, Message) {
        match action {
            Action::Redecode { ticket, request } => (ticket, redecode_message(request).unwrap()),
            other => panic!("expected a re-decode, got {:?}", other),
        }
    }

    #[test]
    fn test_edit_redecodes_only_that_message() {
        let source = source();
        let mut orch = orchestrator();
        let a0 = started(&mut orch);
        let (s0, r0) = run_fetch(&source, &a0);
        orch.on_part(s0, r0);

        let edited = MessageKey::new(0, 0x201);
        let other = MessageKey::new(0, 0x300);
        let other_before = orch.store().get(&other).unwrap().clone();

        let (ticket, message) =
            redecode(single(orch.commit_signal_edit(edited, vec![Signal::new("Both", 0, 16)]).unwrap()));
        assert!(orch.on_redecoded(ticket, message));

        let message = orch.store().get(&edited).unwrap();
        assert_eq!(message.signals[0].name, "Both");
        assert_eq!(message.entries[0].values["Both"], 256.0);
        assert_eq!(message.signal_version, orch.dbc().signal_version(0x201));

        let other_after = orch.store().get(&other).unwrap();
        assert_eq!(*other_after, other_before);
        assert!(Arc::ptr_eq(&other_after.entries, &other_before.entries));
    }

    #[test]
    fn test_edit_of_unknown_address_synthesises_frame() {
        let source = source();
        let mut orch = orchestrator();
        let a0 = started(&mut orch);
        let (s0, r0) = run_fetch(&source, &a0);
        orch.on_part(s0, r0);

        let key = MessageKey::new(0, 0x300);
        assert!(orch.store().get(&key).unwrap().frame.is_none());
        let frame = orch.begin_edit(key).unwrap();
        assert_eq!(frame.name, "MSG_300");
        assert_eq!(orch.view().editing, Some(key));
        assert!(orch.store().get(&key).unwrap().frame.is_some());

        let (ticket, message) = redecode(single(orch.commit_signal_edit(key, vec![Signal::new("B0", 0, 8)]).unwrap()));
        assert!(orch.on_redecoded(ticket, message));
        assert_eq!(orch.store().get(&key).unwrap().entries[0].values["B0"], 0.0);
        assert!(orch.dbc().frame(0x300).is_some());
    }

    #[test]
    fn test_edit_during_chain_keeps_merge_outcome_consistent() {
        let source = source();
        let mut orch = orchestrator();
        let a0 = started(&mut orch);
        let (s0, r0) = run_fetch(&source, &a0);
        let a1 = single(orch.on_part(s0, r0));

        // Part 1 was requested with the old signal set; edit 0x201 now
        let key = MessageKey::new(0, 0x201);
        let edit = single(orch.commit_signal_edit(key, vec![Signal::new("Both", 0, 16)]).unwrap());

        let (s1, r1) = run_fetch(&source, &a1);
        let a2 = single(orch.on_part(s1, r1));
        assert!(matches!(&a2, Action::FetchPart { request, .. } if request.part == 2));

        // Until the re-decode lands, every entry still matches the old signals
        let message = orch.store().get(&key).unwrap();
        assert!(message.entries.iter().all(|e| e.values.contains_key("Seq")));

        let (ticket, message) = redecode(edit);
        assert!(orch.on_redecoded(ticket, message));

        let message = orch.store().get(&key).unwrap();
        assert_eq!(message.entries.len(), 4);
        assert!(message.entries.iter().all(|e| e.values.contains_key("Both")));
        assert_eq!(message.entries[3].values["Both"], (2 * 256 + 1) as f64);

        // Part 2 was requested after the edit and merges consistently
        let (s2, r2) = run_fetch(&source, &a2);
        orch.on_part(s2, r2);
        let message = orch.store().get(&key).unwrap();
        assert_eq!(message.entries.len(), 6);
        assert!(message.entries.iter().all(|e| e.values.contains_key("Both")));
        assert_eq!(*orch.chain_state(), ChainState::Done);
    }

    #[test]
    fn test_edit_after_window_change_applies_to_new_chain_only() {
        let source = source();
        let mut orch = orchestrator();
        let a0 = started(&mut orch);
        let (s0, r0) = run_fetch(&source, &a0);
        let a1 = single(orch.on_part(s0, r0));

        // Part 1 of [0, 2] in flight; the window moves, then 0x201 is edited
        let fresh = single(orch.change_window(2).unwrap());
        let key = MessageKey::new(0, 0x201);
        let edit = orch.commit_signal_edit(key, vec![Signal::new("Both", 0, 16)]).unwrap();
        assert!(edit.is_empty(), "nothing stored to re-decode");

        let (s1, r1) = run_fetch(&source, &a1);
        assert!(orch.on_part(s1, r1).is_empty());
        assert!(orch.store().is_empty());
        assert_eq!(*orch.chain_state(), ChainState::FetchingPart(2));

        // Part 2 was requested before the edit; the merge moves it onto the
        // edited signals
        let mut action = fresh;
        loop {
            let (stamp, result) = run_fetch(&source, &action);
            let mut next = orch.on_part(stamp, result);
            if next.is_empty() {
                break;
            }
            action = next.remove(0);
        }

        assert_eq!(*orch.chain_state(), ChainState::Done);
        assert_eq!(orch.store().merged_parts().iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        let message = orch.store().get(&key).unwrap();
        assert_eq!(message.signals[0].name, "Both");
        assert_eq!(message.signal_version, orch.dbc().signal_version(0x201));
        let values: Vec<f64> = message.entries.iter().map(|e| e.values["Both"]).collect();
        assert_eq!(values, vec![258.0, 514.0, 259.0, 515.0, 260.0, 516.0]);
    }

    #[test]
    fn test_edited_message_matches_a_fresh_fetch() {
        let segment = SegmentWriter::new()
            .frame(SECOND, 0, 0x201, &[1, 2])
            .frame(2 * SECOND, 0, 0x201, &[3])
            .finish();
        let source = MemoryPartSource::new().with_part(0, segment);
        let mut dbc = Dbc::new();
        dbc.set_signals(0x201, vec![Signal::new("B0", 0, 8)]).unwrap();
        let route = Route { url: "mem://short".to_string(), part_count: 1 };
        let mut orch = Orchestrator::new(route, dbc, "test.dbc", ExplorerConfig::default()).unwrap();

        let a0 = started(&mut orch);
        let (s0, r0) = run_fetch(&source, &a0);
        orch.on_part(s0, r0);
        let key = MessageKey::new(0, 0x201);
        assert_eq!(orch.store().get(&key).unwrap().entries.len(), 2);

        // The one-byte frame does not fit a 16 bit signal
        let (ticket, message) =
            redecode(single(orch.commit_signal_edit(key, vec![Signal::new("W", 0, 16)]).unwrap()));
        assert!(orch.on_redecoded(ticket, message));
        let edited = orch.store().get(&key).unwrap().clone();

        let again = single(orch.change_window(0).unwrap());
        let (stamp, result) = run_fetch(&source, &again);
        orch.on_part(stamp, result);
        let refetched = orch.store().get(&key).unwrap();

        assert_eq!(edited.entries.len(), 1);
        assert_eq!(refetched.entries, edited.entries);
        assert_eq!(refetched.undecoded, edited.undecoded);

        // Editing back restores the frame the wide signal could not decode
        let (ticket, message) =
            redecode(single(orch.commit_signal_edit(key, vec![Signal::new("B0", 0, 8)]).unwrap()));
        assert!(orch.on_redecoded(ticket, message));
        let values: Vec<f64> = orch.store().get(&key).unwrap().entries.iter().map(|e| e.values["B0"]).collect();
        assert_eq!(values, vec![1.0, 3.0]);
    }

    #[test]
    fn test_rejected_edit_changes_nothing() {
        let source = source();
        let mut orch = orchestrator();
        let a0 = started(&mut orch);
        let (s0, r0) = run_fetch(&source, &a0);
        orch.on_part(s0, r0);

        let key = MessageKey::new(0, 0x201);
        let before = orch.store().get(&key).unwrap().clone();
        let version = orch.dbc().signal_version(0x201);

        let err = orch
            .commit_signal_edit(key, vec![Signal::new("Wheel Speed", 0, 16)])
            .unwrap_err();
        assert!(matches!(err, ExplorerError::InvalidDefinition { address: 0x201, .. }));
        assert_eq!(orch.dbc().signal_version(0x201), version);
        assert_eq!(orch.dbc().get_signals(0x201)[0].name, "Part");
        assert_eq!(*orch.store().get(&key).unwrap(), before);
    }

    #[test]
    fn test_superseded_edit_is_discarded() {
        let source = source();
        let mut orch = orchestrator();
        let a0 = started(&mut orch);
        let (s0, r0) = run_fetch(&source, &a0);
        orch.on_part(s0, r0);

        let key = MessageKey::new(0, 0x201);
        let first = single(orch.commit_signal_edit(key, vec![Signal::new("First", 0, 8)]).unwrap());
        let second = single(orch.commit_signal_edit(key, vec![Signal::new("Second", 0, 8)]).unwrap());

        let (t2, m2) = redecode(second);
        let (t1, m1) = redecode(first);
        assert!(orch.on_redecoded(t2, m2));
        assert!(!orch.on_redecoded(t1, m1));
        assert_eq!(orch.store().get(&key).unwrap().signals[0].name, "Second");
    }

    #[test]
    fn test_redecode_after_window_change_is_discarded() {
        let source = source();
        let mut orch = orchestrator();
        let a0 = started(&mut orch);
        let (s0, r0) = run_fetch(&source, &a0);
        orch.on_part(s0, r0);

        let key = MessageKey::new(0, 0x201);
        let edit = single(orch.commit_signal_edit(key, vec![Signal::new("Both", 0, 16)]).unwrap());
        orch.change_window(2).unwrap();

        let (ticket, message) = redecode(edit);
        assert!(!orch.on_redecoded(ticket, message));
        assert!(orch.store().is_empty());
    }

    #[test]
    fn test_select_message_aligns_seek() {
        let source = source();
        let mut orch = orchestrator();
        let a0 = started(&mut orch);
        let (s0, r0) = run_fetch(&source, &a0);
        orch.on_part(s0, r0);

        let key = MessageKey::new(0, 0x201);
        orch.seek(0, 0.7);
        orch.select_message(key);
        let view = orch.view();
        assert_eq!(view.selected, Some(key));
        assert_eq!(view.seek_index, 1);
        assert_eq!(view.seek_time, 1.0);

        // Past the last entry: back to the first
        orch.seek(0, 99.0);
        orch.select_message(key);
        assert_eq!(orch.view().seek_index, 0);
        assert_eq!(orch.view().seek_time, 0.0);

        orch.change_window(1).unwrap();
        assert_eq!(orch.view().selected, None);
    }

    #[test]
    fn test_mark_saved_keeps_generation() {
        let mut orch = orchestrator();
        let before = orch.generation();
        let at = Utc::now();
        orch.mark_saved("saved.dbc", at);
        assert_eq!(orch.generation(), before);
        assert_eq!(orch.view().dbc_last_saved, Some(at));
        assert_eq!(orch.dbc_filename(), "saved.dbc");
    }

    #[test]
    fn test_empty_route_cannot_load() {
        let route = Route { url: "mem://empty".to_string(), part_count: 0 };
        assert!(matches!(
            Orchestrator::new(route, Dbc::new(), "x.dbc", ExplorerConfig::default()),
            Err(ExplorerError::InvalidWindow { part_count: 0, .. })
        ));
    }
}
