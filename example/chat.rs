//! bevy + bevy_transcript mental-health chat demo (groq / openai-compatible).
//! - the full transcript is rendered from the `Transcript` component; the
//!   stream line shows live deltas while a completion is in flight.
//! - the directive (system instruction) is editable at runtime (tab to
//!   focus it) and only affects the next submission.
//! - F2 toggles the "show how I thought" reasoning lines on assistant turns.
//!
//! configuration is env-only: GROQ_API_KEY, LLM_MODEL, LLM_BASE_URL.

use bevy::input::keyboard::{KeyCode, KeyboardInput};
use bevy::prelude::*;
use bevy_transcript::{
    ChatCompletedEvt, ChatDeltaEvt, ChatErrorEvt, ChatSession, Directive, LLMBackend,
    LlmCompletionProvider, ProviderConfig, Providers, Role, Transcript, TranscriptPlugin,
    submit_user_text,
};
use std::sync::Arc;

// ---------------------- ui tags ----------------------

#[derive(Component)]
struct HistoryText;
#[derive(Component)]
struct StreamText;
#[derive(Component)]
struct PromptText;
#[derive(Component)]
struct DirectiveText;
#[derive(Component)]
struct ConversationBox;

#[derive(Component, Copy, Clone)]
struct TargetSession(Entity);

// ---------------------- app state ----------------------

#[derive(Resource, Default)]
struct PromptBuf(String);

#[derive(Resource, Default)]
struct ShowReasoning(bool);

#[derive(Resource)]
struct Focus(FocusField);
impl Default for Focus {
    fn default() -> Self {
        Self(FocusField::Prompt)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FocusField {
    Directive,
    Prompt,
}

// ---------------------- provider ----------------------

const DEFAULT_DIRECTIVE: &str = "You are a compassionate mental health assistant. \
Only answer mental health-related questions. For other topics, respond: \
'I specialize in mental health. How can I support you today?'";

fn normalize_oai_base(base: &str) -> String {
    // provider requires base to include `/v1` (this avoids 404s on chat endpoints).
    let b = base.trim_end_matches('/');
    if b.ends_with("/v1") {
        b.to_string()
    } else {
        format!("{}/v1", b)
    }
}

fn provider_from_env() -> Arc<LlmCompletionProvider> {
    let base_url = std::env::var("LLM_BASE_URL").ok();
    let api_key = std::env::var("GROQ_API_KEY").ok();
    let model = std::env::var("LLM_MODEL")
        .unwrap_or_else(|_| "deepseek-r1-distill-llama-70b".to_string());
    info!(
        target: "chat_demo",
        "provider_from_env: base_url={:?}, model='{}', key_present={}",
        base_url, model, api_key.is_some()
    );
    Arc::new(LlmCompletionProvider::new(ProviderConfig {
        backend: LLMBackend::Groq,
        base_url: base_url.as_deref().map(normalize_oai_base),
        api_key,
        model,
    }))
}

// ---------------------- main ----------------------

fn main() {
    #[cfg(target_arch = "wasm32")]
    console_error_panic_hook::set_once();

    App::new()
        .insert_resource(ClearColor(Color::srgb_u8(18, 18, 20)))
        .insert_resource(Directive(DEFAULT_DIRECTIVE.to_string()))
        .insert_resource(PromptBuf::default())
        .insert_resource(ShowReasoning::default())
        .insert_resource(Focus::default())
        .insert_resource(Providers::new(provider_from_env()))
        .add_plugins(DefaultPlugins)
        .add_plugins(TranscriptPlugin)
        .add_systems(Startup, setup)
        // non-event ui + housekeeping can run anytime in Update
        .add_systems(
            Update,
            (handle_text_input, refresh_directive_text, refresh_prompt_text),
        )
        // transcript/event readers run after bevy_transcript commits turns
        .add_systems(
            Update,
            (on_delta, on_done, on_error, render_transcript, autoscroll)
                .after(bevy_transcript::ChatSet::Drain),
        )
        .run();
}

// ---------------------- setup ui ----------------------

fn setup(mut commands: Commands, assets: Res<AssetServer>) {
    commands.spawn(Camera2d::default());

    // chat session entity: transcript lives alongside the session marker
    let session = commands
        .spawn((ChatSession::default(), Transcript::default()))
        .id();

    let font: Handle<Font> = assets.load("fonts/Caveat-Regular.ttf");
    let style_18 = TextFont {
        font: font.clone(),
        font_size: 18.0,
        ..default()
    };
    let style_14 = TextFont {
        font: font.clone(),
        font_size: 14.0,
        ..default()
    };

    // root: directive line, conversation box, prompt line
    commands
        .spawn((
            Node {
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                flex_direction: FlexDirection::Column,
                row_gap: Val::Px(8.0),
                padding: UiRect::all(Val::Px(12.0)),
                ..default()
            },
            BackgroundColor(Color::NONE),
        ))
        .with_children(|p| {
            p.spawn((
                Text::new(""),
                style_14.clone(),
                TextColor(Color::WHITE),
                DirectiveText,
            ));

            // scrollable conversation box
            p.spawn((
                Node {
                    width: Val::Percent(100.0),
                    height: Val::Percent(100.0),
                    flex_direction: FlexDirection::Column,
                    row_gap: Val::Px(8.0),
                    padding: UiRect::axes(Val::Px(8.0), Val::Px(12.0)),
                    overflow: Overflow::scroll_y(),
                    ..default()
                },
                BackgroundColor(Color::srgb(0.10, 0.10, 0.12)),
                ScrollPosition::default(),
                ConversationBox,
            ))
            .with_children(|c| {
                c.spawn((
                    Text::new(""),
                    style_18.clone(),
                    TextColor(Color::WHITE),
                    HistoryText,
                    TargetSession(session),
                ));
                c.spawn((
                    Text::new(""),
                    style_18.clone(),
                    TextColor(Color::srgb_u8(200, 200, 200)),
                    StreamText,
                    TargetSession(session),
                ));
            });

            p.spawn((
                Text::new("> "),
                style_14.clone(),
                TextColor(Color::WHITE),
                PromptText,
                TargetSession(session),
            ));
        });
}

// ---------------------- input ----------------------

fn handle_text_input(
    mut commands: Commands,
    mut ev_kbd: EventReader<KeyboardInput>,
    keys: Res<ButtonInput<KeyCode>>,
    mut focus: ResMut<Focus>,
    mut directive: ResMut<Directive>,
    mut prompt: ResMut<PromptBuf>,
    mut show: ResMut<ShowReasoning>,
    q_prompt_target: Query<&TargetSession, With<PromptText>>,
) {
    // switch focus with tab
    if keys.just_pressed(KeyCode::Tab) {
        focus.0 = match focus.0 {
            FocusField::Directive => FocusField::Prompt,
            FocusField::Prompt => FocusField::Directive,
        };
        info!(target: "chat_demo", "focus -> {:?}", focus.0);
    }

    // toggle the reasoning expander
    if keys.just_pressed(KeyCode::F2) {
        show.0 = !show.0;
        info!(target: "chat_demo", "show reasoning -> {}", show.0);
    }

    // collect text per-focused field
    for ev in ev_kbd.read() {
        if ev.state.is_pressed() {
            if let Some(txt) = &ev.text {
                let s = txt.replace('\r', "").replace('\n', "");
                match focus.0 {
                    FocusField::Directive => directive.0.push_str(&s),
                    FocusField::Prompt => prompt.0.push_str(&s),
                }
            }
        }
    }

    // backspace on focused field
    if keys.just_pressed(KeyCode::Backspace) {
        match focus.0 {
            FocusField::Directive => {
                directive.0.pop();
            }
            FocusField::Prompt => {
                prompt.0.pop();
            }
        }
    }

    // enter submits in the prompt field; the directive needs no apply step,
    // it is read when the next request is built
    if keys.just_pressed(KeyCode::Enter) {
        if let FocusField::Prompt = focus.0 {
            if let Ok(TargetSession(e)) = q_prompt_target.single() {
                if !prompt.0.trim().is_empty() {
                    let msg = std::mem::take(&mut prompt.0);
                    submit_user_text(&mut commands, *e, msg);
                }
            }
        }
    }
}

// ---------------------- text refresh ----------------------

fn refresh_directive_text(
    directive: Res<Directive>,
    focus: Res<Focus>,
    mut q: Query<&mut Text, With<DirectiveText>>,
) {
    if directive.is_changed() || focus.is_changed() {
        if let Ok(mut t) = q.single_mut() {
            let caret = if matches!(focus.0, FocusField::Directive) {
                " |"
            } else {
                ""
            };
            t.0 = format!("directive: {}{}", directive.0, caret);
        }
    }
}

fn refresh_prompt_text(
    prompt: Res<PromptBuf>,
    focus: Res<Focus>,
    mut q_prompt: Query<&mut Text, With<PromptText>>,
) {
    if prompt.is_changed() || focus.is_changed() {
        if let Ok(mut t) = q_prompt.single_mut() {
            let caret = if matches!(focus.0, FocusField::Prompt) {
                " |"
            } else {
                ""
            };
            t.0 = format!("> {}{}", prompt.0, caret);
        }
    }
}

// ---------------------- transcript rendering ----------------------

fn render_transcript(
    show: Res<ShowReasoning>,
    q_transcript: Query<(Entity, &Transcript)>,
    changed: Query<Entity, Changed<Transcript>>,
    mut q_hist: Query<(&TargetSession, &mut Text), With<HistoryText>>,
) {
    let any_changed = !changed.is_empty() || show.is_changed();
    if !any_changed {
        return;
    }

    for (session, transcript) in q_transcript.iter() {
        let mut out = String::new();
        for turn in transcript.all() {
            match turn.role {
                Role::User => {
                    out.push_str("you: ");
                    out.push_str(&turn.content);
                    out.push('\n');
                }
                Role::Assistant => {
                    out.push_str("assistant: ");
                    out.push_str(&turn.content);
                    out.push('\n');
                    if let Some(reasoning) = &turn.reasoning {
                        if show.0 {
                            out.push_str("  how I thought: ");
                            out.push_str(reasoning);
                            out.push('\n');
                        } else {
                            out.push_str("  [F2: show how I thought]\n");
                        }
                    }
                }
            }
        }
        for (TargetSession(t), mut h) in q_hist.iter_mut() {
            if *t == session {
                h.0 = out.clone();
            }
        }
    }
}

// scroll the conversation box to the newest entry once per append;
// the store sets the flag, the display surface owner clears it here
fn autoscroll(
    mut q_transcript: Query<&mut Transcript>,
    mut q_scroll: Query<&mut ScrollPosition, With<ConversationBox>>,
) {
    for mut transcript in q_transcript.iter_mut() {
        // clearing the flag is not a content change; don't retrigger renders
        let transcript = transcript.bypass_change_detection();
        if transcript.take_scroll_pending() {
            for mut sp in q_scroll.iter_mut() {
                sp.offset_y = f32::MAX;
            }
        }
    }
}

// ---------------------- chat events ----------------------

fn on_delta(
    mut ev: EventReader<ChatDeltaEvt>,
    mut q: Query<(&TargetSession, &mut Text), With<StreamText>>,
) {
    use std::collections::HashMap;
    // group all deltas per-entity so we touch Text once per frame
    let mut per_entity: HashMap<Entity, String> = HashMap::new();
    for ChatDeltaEvt { entity, text } in ev.read() {
        per_entity.entry(*entity).or_default().push_str(text);
    }
    for (TargetSession(t), mut ui) in q.iter_mut() {
        if let Some(buf) = per_entity.remove(t) {
            ui.0.push_str(&buf);
        }
    }
}

fn on_done(
    mut ev: EventReader<ChatCompletedEvt>,
    mut q_stream: Query<(&TargetSession, &mut Text), With<StreamText>>,
) {
    // the committed turn lives in the transcript; just clear the live line
    for ChatCompletedEvt { entity, .. } in ev.read() {
        for (TargetSession(t), mut s) in q_stream.iter_mut() {
            if *t == *entity {
                s.0.clear();
            }
        }
    }
}

fn on_error(
    mut ev: EventReader<ChatErrorEvt>,
    mut q_stream: Query<(&TargetSession, &mut Text), With<StreamText>>,
) {
    // the error turn is already in the transcript; clear the live line
    for ChatErrorEvt { entity, error } in ev.read() {
        error!(target: "chat_demo", "chat error (entity={:?}): {}", entity, error);
        for (TargetSession(t), mut s) in q_stream.iter_mut() {
            if *t == *entity {
                s.0.clear();
            }
        }
    }
}
