//! Video frame reassembly with XOR forward error correction
//!
//! Fragments arrive unordered and lossy. Each call ingests a batch, tries to
//! rebuild single losses per FEC group from parity, asks the sender for what
//! parity cannot cover, and hands back every frame whose fragments are all
//! present.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use log::{debug, info};

use crate::pipeline::health::SessionHealth;
use crate::protocol::{Fragment, ProtocolParams, VideoFrame, xor_into};

/// Number of frame slots tracked at once. Must exceed the deepest
/// reorder/loss span the stream is expected to survive.
pub const FRAME_WINDOW: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct AssemblerConfig {
    /// Once a frame completes, abandon every older frame and ignore any
    /// fragment that arrives for one later.
    pub drop_superseded: bool,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            drop_superseded: true,
        }
    }
}

/// A frame that is fully present, as raw message bytes and parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledFrame {
    pub frame_id: u32,
    pub raw: Bytes,
    pub frame: VideoFrame,
}

/// Fragments of one frame that must be sent again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentRequest {
    pub frame_id: u32,
    pub video_indices: Vec<u32>,
    pub parity_indices: Vec<u32>,
}

#[derive(Debug, Default)]
pub struct AssemblyOutput {
    /// Completed frames, ascending by frame id
    pub frames: Vec<AssembledFrame>,
    /// At most one request per incomplete frame
    pub requests: Vec<FragmentRequest>,
}

/// Working state for one frame.
#[derive(Debug)]
struct FrameSlot {
    frame_id: u32,
    video: Vec<Option<Bytes>>,
    parity: Vec<Option<Bytes>>,
}

impl FrameSlot {
    fn new(frame_id: u32, video_count: usize, params: &ProtocolParams) -> Self {
        Self {
            frame_id,
            video: vec![None; video_count],
            parity: vec![None; params.parity_count(video_count)],
        }
    }

    fn is_complete(&self) -> bool {
        self.video.iter().all(Option::is_some)
    }

    fn concat(&self) -> Bytes {
        let len = self.video.iter().flatten().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(len);
        for payload in self.video.iter().flatten() {
            buf.extend_from_slice(payload);
        }
        buf.freeze()
    }
}

/// Ring of frame slots indexed by `frame_id % FRAME_WINDOW`.
#[derive(Debug)]
struct FrameWindow {
    slots: Vec<Option<FrameSlot>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotLookup {
    Existing,
    Vacant,
    /// Occupied by a newer frame; the fragment is too old for the window
    TooOld,
}

impl FrameWindow {
    fn new() -> Self {
        Self {
            slots: (0..FRAME_WINDOW).map(|_| None).collect(),
        }
    }

    fn index(frame_id: u32) -> usize {
        frame_id as usize % FRAME_WINDOW
    }

    fn lookup(&self, frame_id: u32) -> SlotLookup {
        match &self.slots[Self::index(frame_id)] {
            Some(slot) if slot.frame_id == frame_id => SlotLookup::Existing,
            Some(slot) if slot.frame_id > frame_id => SlotLookup::TooOld,
            _ => SlotLookup::Vacant,
        }
    }

    /// Place `slot`, returning the older frame it displaced.
    fn insert(&mut self, slot: FrameSlot) -> Option<FrameSlot> {
        self.slots[Self::index(slot.frame_id)].replace(slot)
    }

    fn get_mut(&mut self, frame_id: u32) -> Option<&mut FrameSlot> {
        self.slots[Self::index(frame_id)]
            .as_mut()
            .filter(|slot| slot.frame_id == frame_id)
    }

    fn remove(&mut self, frame_id: u32) -> Option<FrameSlot> {
        let entry = &mut self.slots[Self::index(frame_id)];
        if entry.as_ref().is_some_and(|slot| slot.frame_id == frame_id) {
            entry.take()
        } else {
            None
        }
    }

    /// Tracked frame ids, ascending.
    fn frame_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.slots.iter().flatten().map(|s| s.frame_id).collect();
        ids.sort_unstable();
        ids
    }

    fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FragmentKind {
    Video,
    Parity,
}

/// Turns video and parity fragments from one sender into complete frames.
pub struct VideoFrameAssembler {
    params: ProtocolParams,
    config: AssemblerConfig,
    window: FrameWindow,
    /// Recently completed frame ids, so late duplicates do not reopen them
    completed: VecDeque<u32>,
    /// Newest frame id assembled so far
    newest_completed: Option<u32>,
    health: Arc<SessionHealth>,
}

impl VideoFrameAssembler {
    pub fn new(params: ProtocolParams, config: AssemblerConfig, health: Arc<SessionHealth>) -> Self {
        Self {
            params,
            config,
            window: FrameWindow::new(),
            completed: VecDeque::with_capacity(FRAME_WINDOW),
            newest_completed: None,
            health,
        }
    }

    /// Number of frames currently being tracked.
    pub fn tracked_frames(&self) -> usize {
        self.window.len()
    }

    /// Ids of frames currently being tracked, ascending.
    pub fn tracked_frame_ids(&self) -> Vec<u32> {
        self.window.frame_ids()
    }

    /// Run one assembly pass over a batch of newly arrived fragments.
    ///
    /// `last_rendered` is the newest frame id the consumer has displayed;
    /// nothing at or below it is tracked or emitted.
    pub fn assemble(
        &mut self,
        video: Vec<Fragment>,
        parity: Vec<Fragment>,
        last_rendered: Option<u32>,
    ) -> AssemblyOutput {
        let superseded_below = self.newest_completed.filter(|_| self.config.drop_superseded);
        let is_stale = |frame_id: u32| {
            last_rendered.is_some_and(|r| frame_id <= r)
                || superseded_below.is_some_and(|newest| frame_id < newest)
        };

        let mut newest_added: Option<u32> = None;
        let batch = video
            .into_iter()
            .map(|f| (FragmentKind::Video, f))
            .chain(parity.into_iter().map(|f| (FragmentKind::Parity, f)));

        for (kind, fragment) in batch {
            if is_stale(fragment.frame_id) || self.completed.contains(&fragment.frame_id) {
                SessionHealth::incr(&self.health.fragments_dropped);
                continue;
            }
            if let Some(added) = self.ingest(kind, fragment) {
                newest_added = newest_added.max(Some(added));
            }
        }

        let mut output = AssemblyOutput::default();

        if let Some(newest) = newest_added {
            output.requests = self.recover_older_than(newest);
        }

        output.frames = self.sweep_completed();

        if let Some(latest) = output.frames.last().map(|f| f.frame_id) {
            self.newest_completed = self.newest_completed.max(Some(latest));
        }
        if self.config.drop_superseded
            && let Some(newest) = self.newest_completed
        {
            self.discard_where(|id| id < newest);
            output.requests.retain(|r| r.frame_id > newest);
        }

        // Frames that became obsolete during this call without completing.
        if let Some(rendered) = last_rendered {
            self.discard_where(|id| id <= rendered);
        }

        output
    }

    /// Store one fragment. Returns the frame id when this fragment opened a
    /// new frame.
    fn ingest(&mut self, kind: FragmentKind, fragment: Fragment) -> Option<u32> {
        let video_count = fragment.count as usize;
        let index = fragment.index as usize;
        let frame_id = fragment.frame_id;

        let in_range = match kind {
            FragmentKind::Video => index < video_count,
            FragmentKind::Parity => index < self.params.parity_count(video_count),
        };
        if video_count == 0 || !in_range {
            debug!(
                "frame {}: fragment index {} out of range for {} fragments",
                frame_id, index, video_count
            );
            SessionHealth::incr(&self.health.malformed_packets);
            return None;
        }

        let mut added = None;
        match self.window.lookup(frame_id) {
            SlotLookup::Existing => {}
            SlotLookup::TooOld => {
                debug!("frame {}: older than its window slot, dropping fragment", frame_id);
                SessionHealth::incr(&self.health.fragments_dropped);
                return None;
            }
            SlotLookup::Vacant => {
                let slot = FrameSlot::new(frame_id, video_count, &self.params);
                if let Some(evicted) = self.window.insert(slot) {
                    info!(
                        "frame {} evicted incomplete frame {} from the window",
                        frame_id, evicted.frame_id
                    );
                    SessionHealth::incr(&self.health.frames_dropped);
                }
                added = Some(frame_id);
            }
        }

        let slot = self.window.get_mut(frame_id)?;

        if slot.video.len() != video_count {
            debug!(
                "frame {}: fragment count {} disagrees with tracked {}",
                frame_id,
                video_count,
                slot.video.len()
            );
            SessionHealth::incr(&self.health.malformed_packets);
            return added;
        }

        let (entry, counter) = match kind {
            FragmentKind::Video => (&mut slot.video[index], &self.health.video_fragments),
            FragmentKind::Parity => (&mut slot.parity[index], &self.health.parity_fragments),
        };
        if entry.is_some() {
            SessionHealth::incr(&self.health.fragments_dropped);
        } else {
            *entry = Some(fragment.payload);
            SessionHealth::incr(counter);
        }

        added
    }

    /// FEC pass over incomplete frames strictly older than `newest`.
    fn recover_older_than(&mut self, newest: u32) -> Vec<FragmentRequest> {
        let mut requests = Vec::new();

        for frame_id in self.window.frame_ids() {
            if frame_id >= newest {
                break;
            }
            let params = self.params;
            let Some(slot) = self.window.get_mut(frame_id) else {
                continue;
            };
            if slot.is_complete() {
                continue;
            }

            let (recovered, request) = recover_slot(slot, &params);
            SessionHealth::add(&self.health.fragments_recovered, recovered as u64);
            if recovered > 0 {
                debug!("frame {}: recovered {} fragment(s) from parity", frame_id, recovered);
            }
            if let Some(request) = request {
                requests.push(request);
            }
        }

        requests
    }

    fn sweep_completed(&mut self) -> Vec<AssembledFrame> {
        let mut frames = Vec::new();

        for frame_id in self.window.frame_ids() {
            let complete = self
                .window
                .get_mut(frame_id)
                .is_some_and(|slot| slot.is_complete());
            if !complete {
                continue;
            }
            let Some(slot) = self.window.remove(frame_id) else {
                continue;
            };

            if self.completed.len() == FRAME_WINDOW {
                self.completed.pop_front();
            }
            self.completed.push_back(frame_id);

            let raw = slot.concat();
            match VideoFrame::parse(raw.clone()) {
                Ok(frame) => {
                    SessionHealth::incr(&self.health.frames_completed);
                    frames.push(AssembledFrame {
                        frame_id,
                        raw,
                        frame,
                    });
                }
                Err(e) => {
                    debug!("frame {}: assembled message is malformed: {}", frame_id, e);
                    SessionHealth::incr(&self.health.frames_dropped);
                }
            }
        }

        frames
    }

    fn discard_where(&mut self, predicate: impl Fn(u32) -> bool) {
        for frame_id in self.window.frame_ids() {
            if predicate(frame_id) && self.window.remove(frame_id).is_some() {
                SessionHealth::incr(&self.health.frames_dropped);
            }
        }
    }
}

/// Rebuild single losses per FEC group; collect what parity cannot cover.
fn recover_slot(slot: &mut FrameSlot, params: &ProtocolParams) -> (usize, Option<FragmentRequest>) {
    let video_count = slot.video.len();
    let mut recovered = 0;
    let mut video_indices = Vec::new();
    let mut parity_indices = Vec::new();

    for parity_index in 0..slot.parity.len() {
        let range = params.group_range(parity_index, video_count);
        let missing: Vec<usize> = range.clone().filter(|&i| slot.video[i].is_none()).collect();
        if missing.is_empty() {
            continue;
        }

        match &slot.parity[parity_index] {
            None => {
                video_indices.extend(missing.iter().map(|&i| i as u32));
                parity_indices.push(parity_index as u32);
            }
            Some(parity) if missing.len() == 1 => {
                let lost = missing[0];
                let mut rebuilt = parity.to_vec();
                for payload in range.filter(|&i| i != lost).filter_map(|i| slot.video[i].as_ref()) {
                    xor_into(&mut rebuilt, payload);
                }
                slot.video[lost] = Some(Bytes::from(rebuilt));
                recovered += 1;
            }
            Some(_) => video_indices.extend(missing.iter().map(|&i| i as u32)),
        }
    }

    let request = (!video_indices.is_empty() || !parity_indices.is_empty()).then(|| FragmentRequest {
        frame_id: slot.frame_id,
        video_indices,
        parity_indices,
    });
    (recovered, request)
}
