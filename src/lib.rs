//! bevy_transcript: session chat state + streamed-response reconciliation
//! for bevy apps talking to hosted llm apis (via the `llm` crate).
//!
//! - keeps an append-only `Transcript` of user/assistant turns per session
//!   entity; the app's ui renders it and never re-derives history from the
//!   provider.
//! - drains completion token streams off-thread and commits exactly one
//!   finalized assistant turn per submission, splitting an optional
//!   `<think>…</think>` reasoning section out of the visible answer.
//! - provider failures become visible assistant turns too, so the
//!   transcript always alternates user/assistant.
//! - never blocks the main thread: on native we spawn onto a tiny tokio
//!   runtime (no bevy pool blocking); on wasm we use bevy's async pool,
//!   which yields to the browser/event loop.
//!
//! api docs for the provider types (re-exported): https://docs.rs/llm

use bevy::prelude::*;
use bevy::tasks::AsyncComputeTaskPool;
use flume::{Receiver, Sender, TryRecvError};
use futures_lite::StreamExt;
use std::any::type_name_of_val;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod provider;
pub mod reasoning;
pub mod transcript;

pub use provider::{
    CompletionProvider, FragmentStream, LlmCompletionProvider, ProviderConfig, ProviderError,
    MAX_OUTPUT_TOKENS, TEMPERATURE, TOP_P,
};
pub use reasoning::split_reasoning;
pub use transcript::{Role, Transcript, Turn};

/// re-export the llm types the public api leans on.
pub use llm::{
    builder::{LLMBackend, LLMBuilder},
    chat::{ChatMessage, ChatRole},
    error::LLMError,
    LLMProvider,
};

/// a map of ready-to-use completion providers.
///
/// - `default`: used when a `ChatSession` doesn't specify a `key`
/// - `per_key`: named providers if you want multiple backends/models
#[derive(Resource, Clone)]
pub struct Providers {
    pub default: Arc<dyn CompletionProvider>,
    pub per_key: HashMap<String, Arc<dyn CompletionProvider>>,
}

impl Providers {
    pub fn new(default: Arc<dyn CompletionProvider>) -> Self {
        Self { default, per_key: HashMap::new() }
    }
    pub fn with(mut self, key: impl Into<String>, provider: Arc<dyn CompletionProvider>) -> Self {
        self.per_key.insert(key.into(), provider);
        self
    }
    fn get(&self, key: Option<&String>) -> Arc<dyn CompletionProvider> {
        if let Some(k) = key {
            self.per_key.get(k).cloned().unwrap_or_else(|| self.default.clone())
        } else {
            self.default.clone()
        }
    }
}

/// the system instruction sent with every provider request. mutable at any
/// time; it is read when the next request is built, never stored as a turn,
/// and never alters turns already in a transcript.
#[derive(Resource, Clone, Debug, Default)]
pub struct Directive(pub String);

/// on native we keep a tiny tokio runtime to drive `llm` futures.
/// we spawn onto this rt from compute tasks so neither the main thread
/// nor bevy's compute pools block.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Resource, Clone)]
pub struct TokioRt(pub Arc<tokio::runtime::Runtime>);

#[cfg(not(target_arch = "wasm32"))]
impl Default for TokioRt {
    fn default() -> Self {
        info!(target: "bevy_transcript", "initializing Tokio multi-thread runtime (native)");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("tokio runtime");
        Self(Arc::new(rt))
    }
}

/// system ordering so uis can run after we emit events
#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum ChatSet {
    /// bevy_transcript commits turns and emits Chat* events here (in `Update`)
    Drain,
}

/// attach this (plus a `Transcript`) to an entity you want to chat through
/// a completion provider.
#[derive(Component, Clone, Debug, Default)]
pub struct ChatSession {
    /// optional key to pick a provider from `Providers::per_key`.
    pub key: Option<String>,
}

/// pending user submission for a session entity. picked up by the dispatch
/// system on the next frame; stays queued while a completion is in flight.
#[derive(Component, Clone, Debug)]
pub struct PendingSubmission {
    pub text: String,
}

/// marker: a completion stream for this session is being drained. only one
/// submission is in flight per session at a time.
#[derive(Component, Debug)]
pub struct InFlight;

/// helper to enqueue a user message on a session entity.
pub fn submit_user_text(commands: &mut Commands, target: Entity, text: impl Into<String>) {
    let text = text.into();
    info!(target: "bevy_transcript", "submit_user_text -> '{}' (len={})", text, text.len());
    commands.entity(target).insert(PendingSubmission { text });
}

/// events emitted while a submission is answered.
#[derive(Event, Debug)]
pub struct ChatStarted {
    pub entity: Entity,
}
#[derive(Event, Debug)]
pub struct ChatDeltaEvt {
    pub entity: Entity,
    pub text: String,
}
#[derive(Event, Debug)]
pub struct ChatCompletedEvt {
    pub entity: Entity,
    /// the finalized assistant turn, as appended to the transcript.
    pub turn: Turn,
}
#[derive(Event, Debug)]
pub struct ChatErrorEvt {
    pub entity: Entity,
    pub error: String,
}

/// cross-thread inbox for streaming; producers send, main thread drains.
/// bounded to avoid unbounded growth when the frame stalls briefly.
#[derive(Resource, Clone)]
struct StreamInbox {
    tx: Sender<StreamMsg>,
    rx: Receiver<StreamMsg>,
}

impl Default for StreamInbox {
    fn default() -> Self {
        let (tx, rx) = flume::bounded(2048);
        Self { tx, rx }
    }
}

#[derive(Debug)]
enum StreamMsg {
    Begin { entity: Entity },
    Delta { entity: Entity, text: String },
    Done  { entity: Entity, raw: String },
    Err   { entity: Entity, error: ProviderError },
}

/// send to inbox (ignore full/disconnected)
fn push_inbox(tx: &Sender<StreamMsg>, msg: StreamMsg) {
    let _ = tx.send(msg);
}

/// drain one fragment stream to completion: forward coalesced deltas for
/// live display while accumulating the full raw buffer, then hand the
/// buffer over for reconciliation in one `Done`. a mid-stream error yields
/// `Err` instead; the partial buffer is never committed.
///
/// deltas carry only the settled visible text: `<think>` interiors and
/// half-received tags stay hidden until the turn is committed.
async fn pump_stream(entity: Entity, mut stream: FragmentStream, tx: &Sender<StreamMsg>) {
    push_inbox(tx, StreamMsg::Begin { entity });

    let mut raw = String::new();
    let mut shown = 0usize;
    // coalesce tiny deltas to ~60hz or >=64 chars
    const MIN_CHARS: usize = 64;
    const MAX_LATENCY: Duration = Duration::from_millis(16);
    let mut buf = String::new();
    let mut last_flush = Instant::now();

    while let Some(item) = stream.next().await {
        match item {
            Ok(fragment) => {
                if fragment.is_empty() {
                    continue;
                }
                raw.push_str(&fragment);
                // visible_prefix only ever grows by extension, so the
                // un-forwarded tail is a straight byte-range diff
                let visible = reasoning::visible_prefix(&raw);
                if visible.len() > shown {
                    buf.push_str(&visible[shown..]);
                    shown = visible.len();
                }
                if buf.is_empty() {
                    continue;
                }
                let now = Instant::now();
                if buf.len() >= MIN_CHARS || now.duration_since(last_flush) >= MAX_LATENCY {
                    let chunk = std::mem::take(&mut buf);
                    push_inbox(tx, StreamMsg::Delta { entity, text: chunk });
                    last_flush = now;
                }
            }
            Err(error) => {
                error!(target: "bevy_transcript", "streaming error: {}", error);
                // flush whatever we buffered so the live view isn't stale,
                // then report the failure; the raw buffer is dropped.
                if !buf.is_empty() {
                    let chunk = std::mem::take(&mut buf);
                    push_inbox(tx, StreamMsg::Delta { entity, text: chunk });
                }
                push_inbox(tx, StreamMsg::Err { entity, error });
                return;
            }
        }
    }

    // flush tail
    if !buf.is_empty() {
        let chunk = std::mem::take(&mut buf);
        push_inbox(tx, StreamMsg::Delta { entity, text: chunk });
    }
    info!(target: "bevy_transcript", "stream completed: raw_len={}", raw.len());
    push_inbox(tx, StreamMsg::Done { entity, raw });
}

/// bevy plugin: wires systems, events, resources.
/// requires you to insert a `Providers` resource before/after adding the
/// plugin. on native, also inserts a tiny tokio runtime resource by default.
pub struct TranscriptPlugin;

impl Plugin for TranscriptPlugin {
    fn build(&self, app: &mut App) {
        info!(target: "bevy_transcript", "TranscriptPlugin: build()");
        app.init_resource::<StreamInbox>()
            .init_resource::<Directive>()
            .add_event::<ChatStarted>()
            .add_event::<ChatDeltaEvt>()
            .add_event::<ChatCompletedEvt>()
            .add_event::<ChatErrorEvt>()
            // write + read events in the same schedule (Update)
            .configure_sets(Update, ChatSet::Drain)
            .add_systems(Update, drain_stream_inbox.in_set(ChatSet::Drain))
            // dispatch requests in Update; work continues off-thread/tokio
            .add_systems(Update, dispatch_submissions);

        #[cfg(not(target_arch = "wasm32"))]
        if app.world().get_resource::<TokioRt>().is_none() {
            app.insert_resource(TokioRt::default());
        }
    }
}

/// turns pending submissions into provider requests (compute-tasks-first).
///
/// appends the user turn, snapshots the transcript as provider messages
/// plus the current directive, and spawns the stream pump. sessions with a
/// completion already in flight are skipped; their submission stays queued.
fn dispatch_submissions(
    mut commands: Commands,
    providers: Res<Providers>,
    directive: Res<Directive>,
    inbox: Res<StreamInbox>,
    mut q: Query<
        (Entity, &ChatSession, &PendingSubmission, &mut Transcript),
        Without<InFlight>,
    >,
    mut ev_start: EventWriter<ChatStarted>,

    // native-only: small runtime to drive network futures from `llm`
    #[cfg(not(target_arch = "wasm32"))] rt: Res<TokioRt>,
) {
    for (e, session, pending, mut transcript) in q.iter_mut() {
        transcript.append(Turn::user(pending.text.clone()));

        let provider = providers.get(session.key.as_ref());
        let inbox_tx = inbox.tx.clone();
        let messages = transcript.provider_messages();
        let directive = directive.0.clone();

        // logging: provider type + turn stats
        let pty = type_name_of_val(provider.as_ref());
        let user_turns = transcript
            .all()
            .iter()
            .filter(|t| t.role == Role::User)
            .count();
        info!(target: "bevy_transcript",
            "dispatch_submissions: entity={:?} provider={} turns={} (user={})",
            e, pty, transcript.len(), user_turns
        );

        // one-shot marker swap: submission leaves, in-flight guard arrives
        commands.entity(e).remove::<PendingSubmission>().insert(InFlight);
        ev_start.write(ChatStarted { entity: e });

        let pool = AsyncComputeTaskPool::get();
        #[cfg(not(target_arch = "wasm32"))]
        let rt = rt.0.clone();

        // spawn an async compute task; internally we hand off to tokio (native).
        pool.spawn(async move {
            let run = async move {
                match provider.stream_completion(&messages, &directive).await {
                    Err(error) => {
                        error!(target: "bevy_transcript", "completion error: {}", error);
                        push_inbox(&inbox_tx, StreamMsg::Err { entity: e, error });
                    }
                    Ok(stream) => pump_stream(e, stream, &inbox_tx).await,
                }
            };

            #[cfg(target_arch = "wasm32")]
            {
                // wasm path: just await directly (no tokio).
                run.await;
            }
            #[cfg(not(target_arch = "wasm32"))]
            {
                // native: hand off to tokio so bevy pools stay free.
                let _ = rt.spawn(run).await;
            }
        })
        .detach();
    }
}

/// drains the inbox, commits finalized turns, and emits user-facing events.
fn drain_stream_inbox(
    mut commands: Commands,
    inbox: Res<StreamInbox>,
    mut sessions: Query<&mut Transcript>,
    mut ev_delta: EventWriter<ChatDeltaEvt>,
    mut ev_done: EventWriter<ChatCompletedEvt>,
    mut ev_err: EventWriter<ChatErrorEvt>,
) {
    // drain up to a cap per frame to avoid long frames on bursty streams
    const MAX_PER_FRAME: usize = 512;
    let mut drained = Vec::with_capacity(64);
    for _ in 0..MAX_PER_FRAME {
        match inbox.rx.try_recv() {
            Ok(m) => drained.push(m),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => break,
        }
    }
    if drained.is_empty() { return; }

    // aggregate deltas per entity so ui applies a single push per entity per frame
    let mut delta_map: HashMap<Entity, String> = HashMap::new();
    let mut dones: Vec<(Entity, String)> = Vec::new();
    let mut errs: Vec<(Entity, ProviderError)> = Vec::new();

    for msg in drained {
        match msg {
            StreamMsg::Begin { .. } => { /* optional: debug */ }
            StreamMsg::Delta { entity, text } => {
                delta_map.entry(entity).or_default().push_str(&text);
            }
            StreamMsg::Done { entity, raw } => dones.push((entity, raw)),
            StreamMsg::Err { entity, error } => errs.push((entity, error)),
        }
    }

    for (entity, text) in delta_map {
        ev_delta.write(ChatDeltaEvt { entity, text });
    }
    // ensure deltas land before the committed turn for the same frame
    for (entity, raw) in dones {
        let turn = Turn::assistant_from_raw(&raw);
        if let Ok(mut transcript) = sessions.get_mut(entity) {
            transcript.append(turn.clone());
        }
        if let Ok(mut ec) = commands.get_entity(entity) {
            ec.remove::<InFlight>();
        }
        ev_done.write(ChatCompletedEvt { entity, turn });
    }
    for (entity, error) in errs {
        let turn = Turn::provider_failure(&error);
        if let Ok(mut transcript) = sessions.get_mut(entity) {
            transcript.append(turn);
        }
        if let Ok(mut ec) = commands.get_entity(entity) {
            ec.remove::<InFlight>();
        }
        ev_err.write(ChatErrorEvt { entity, error: error.to_string() });
    }
}
