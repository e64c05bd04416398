//! Nudge escalation engine.
//!
//! Pure decision logic: elapsed time since the owner's last message maps
//! onto a 0..=5 escalation level, the owner's active hours gate whether a
//! nudge may go out at all, and each level draws from its own template pool.

use std::collections::BTreeSet;

use nudgeclaw_core::config::NudgeConfig;
use nudgeclaw_core::error::Result;
use nudgeclaw_core::traits::NudgeStateStore;
use nudgeclaw_core::types::UserBehaviorSnapshot;
use rand::seq::SliceRandom;
use serde::Serialize;

/// Highest escalation level.
pub const MAX_LEVEL: u8 = 5;

const DEFAULT_THRESHOLDS: [f64; MAX_LEVEL as usize] = [2.0, 6.0, 12.0, 24.0, 48.0];

/// How a nudge should read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Quiet,
    Informative,
    Friendly,
    Playful,
    Urgent,
}

impl Tone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tone::Quiet => "quiet",
            Tone::Informative => "informative",
            Tone::Friendly => "friendly",
            Tone::Playful => "playful",
            Tone::Urgent => "urgent",
        }
    }

    fn emoji(&self) -> &'static str {
        match self {
            Tone::Quiet => "",
            Tone::Informative => "💡",
            Tone::Friendly => "👋",
            Tone::Playful => "😜",
            Tone::Urgent => "🚨",
        }
    }
}

impl std::fmt::Display for Tone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one nudge evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NudgeDecision {
    pub should_send: bool,
    pub level: u8,
    pub tone: Tone,
    /// Empty when `should_send` is false.
    pub message: String,
}

impl NudgeDecision {
    fn suppressed(level: u8) -> Self {
        Self {
            should_send: false,
            level,
            tone: tone_for(level),
            message: String::new(),
        }
    }
}

/// Tone for a level: informative at the bottom, urgent at the top.
pub fn tone_for(level: u8) -> Tone {
    match level {
        0 => Tone::Quiet,
        1 | 2 => Tone::Informative,
        3 => Tone::Friendly,
        4 => Tone::Playful,
        _ => Tone::Urgent,
    }
}

// Level 1..=5 pools, index = level - 1.
static EN_TEMPLATES: [&[&str]; MAX_LEVEL as usize] = [
    &[
        "Quick reminder: I'm here if you need anything today.",
        "Just a heads-up, I have a few ideas ready whenever you are.",
        "Whenever you have a minute, I'm around to help.",
    ],
    &[
        "It's been a little while. Anything on your plate I can take off?",
        "Haven't heard from you in a few hours. Want to plan the rest of your day?",
        "A short check-in: how are things going?",
    ],
    &[
        "Hey! I've been keeping your seat warm. What are you up to?",
        "Missing our chats. Drop me a line when you get a chance!",
        "Hi again! Anything fun happening today?",
    ],
    &[
        "Knock knock 🚪 Still there? I promise I'm good company.",
        "I've been talking to myself for a day now. Save me?",
        "Day two of waiting by the phone. No pressure... okay, a little pressure.",
    ],
    &[
        "It's been days! Is everything okay? Just reply with anything.",
        "I'm officially worried. Send me a quick hello so I know you're fine.",
        "Long time no see! Let's catch up. Even one word works.",
    ],
];

static VI_TEMPLATES: [&[&str]; MAX_LEVEL as usize] = [
    &[
        "Nhắc nhẹ: mình vẫn ở đây nếu bạn cần gì hôm nay.",
        "Mình có vài gợi ý sẵn sàng bất cứ lúc nào bạn muốn.",
        "Khi nào rảnh một chút, mình luôn sẵn sàng giúp.",
    ],
    &[
        "Lâu rồi chưa nghe bạn nói gì. Có việc gì mình làm giúp được không?",
        "Vài tiếng rồi chưa thấy bạn. Lên kế hoạch cho phần còn lại của ngày nhé?",
        "Hỏi thăm chút: mọi việc thế nào rồi?",
    ],
    &[
        "Này! Mình vẫn đang chờ bạn đây. Bạn đang làm gì thế?",
        "Nhớ những cuộc trò chuyện của tụi mình quá. Nhắn mình khi rảnh nhé!",
        "Chào lại nè! Hôm nay có gì vui không?",
    ],
    &[
        "Cốc cốc 🚪 Bạn còn đó không? Mình hứa là rất vui tính.",
        "Cả ngày nay mình toàn nói chuyện một mình. Cứu mình với?",
        "Ngày thứ hai ngồi chờ tin nhắn. Không ép đâu... à, ép một chút.",
    ],
    &[
        "Mấy ngày rồi! Mọi thứ ổn chứ? Trả lời mình một chữ thôi cũng được.",
        "Mình lo thật rồi đó. Gửi một lời chào để mình yên tâm nhé.",
        "Lâu quá không gặp! Mình nói chuyện chút nhé, một từ cũng được.",
    ],
];

fn templates(locale: &str) -> &'static [&'static [&'static str]; MAX_LEVEL as usize] {
    match locale.split(['-', '_']).next().unwrap_or_default() {
        "vi" => &VI_TEMPLATES,
        _ => &EN_TEMPLATES,
    }
}

/// Nudge escalation policy.
#[derive(Debug, Clone)]
pub struct NudgeEngine {
    thresholds: [f64; MAX_LEVEL as usize],
    default_locale: String,
    max_consecutive: Option<u32>,
    generate_from_level: Option<u8>,
}

impl Default for NudgeEngine {
    fn default() -> Self {
        Self::new(&NudgeConfig::default())
    }
}

impl NudgeEngine {
    pub fn new(config: &NudgeConfig) -> Self {
        Self {
            thresholds: sanitize_thresholds(&config.thresholds_hours),
            default_locale: config.default_locale.clone(),
            max_consecutive: config.max_consecutive_nudges,
            generate_from_level: config.generate_from_level,
        }
    }

    pub fn default_locale(&self) -> &str {
        &self.default_locale
    }

    /// Escalation level for the elapsed time; never decreases as hours grow.
    pub fn compute_level(&self, hours_since_last_interaction: f64) -> u8 {
        self.thresholds
            .iter()
            .filter(|t| hours_since_last_interaction >= **t)
            .count() as u8
    }

    /// False outside the owner's active hours (when known) and below level 1.
    pub fn should_send(
        &self,
        hours_since_last_interaction: f64,
        active_hours: Option<&BTreeSet<u8>>,
        current_hour: u8,
    ) -> bool {
        if let Some(hours) = active_hours {
            if !hours.is_empty() && !hours.contains(&current_hour) {
                return false;
            }
        }
        self.compute_level(hours_since_last_interaction) >= 1
    }

    /// Random pick from the level's pool, prefixed by the tone's marker.
    pub fn select_message(&self, level: u8, tone: Tone, locale: &str) -> String {
        if level == 0 {
            return String::new();
        }
        let pool = templates(locale)[(level.min(MAX_LEVEL) - 1) as usize];
        let text = pool
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or_default();
        match tone.emoji() {
            "" => text.to_string(),
            emoji => format!("{emoji} {text}"),
        }
    }

    /// Full evaluation for one owner at `current_hour` (0..=23, UTC).
    pub fn decide(
        &self,
        snapshot: &UserBehaviorSnapshot,
        current_hour: u8,
        locale: Option<&str>,
    ) -> NudgeDecision {
        let level = self.compute_level(snapshot.hours_since_last_interaction);
        if let Some(max) = self.max_consecutive {
            if snapshot.consecutive_non_responses >= max {
                tracing::debug!(
                    "🔕 Nudge ceiling reached ({} unanswered)",
                    snapshot.consecutive_non_responses
                );
                return NudgeDecision::suppressed(level);
            }
        }
        if !self.should_send(
            snapshot.hours_since_last_interaction,
            snapshot.active_hours.as_ref(),
            current_hour,
        ) {
            return NudgeDecision::suppressed(level);
        }
        let tone = tone_for(level);
        let locale = locale.unwrap_or(&self.default_locale);
        NudgeDecision {
            should_send: true,
            level,
            tone,
            message: self.select_message(level, tone, locale),
        }
    }

    /// Whether a nudge at `level` should use the message generator.
    pub fn wants_generated(&self, level: u8) -> bool {
        self.generate_from_level.is_some_and(|from| level >= from)
    }

    /// Prompt hint for a generated nudge.
    pub fn prompt_hint(&self, decision: &NudgeDecision, locale: &str) -> String {
        format!(
            "The user has not replied for a while (escalation level {} of {MAX_LEVEL}). \
             Write one short {} nudge in locale '{locale}' inviting them back.",
            decision.level, decision.tone
        )
    }

    /// Count a nudge that went out without a reply yet.
    pub async fn record_non_response(
        &self,
        state: &dyn NudgeStateStore,
        owner_id: &str,
    ) -> Result<u32> {
        state.increment_non_responses(owner_id).await
    }

    /// The owner replied; escalation starts over.
    pub async fn reset_non_responses(
        &self,
        state: &dyn NudgeStateStore,
        owner_id: &str,
    ) -> Result<()> {
        state.reset_non_responses(owner_id).await
    }
}

/// Ascending, finite thresholds for levels 1..=5, or the defaults.
fn sanitize_thresholds(configured: &[f64]) -> [f64; MAX_LEVEL as usize] {
    let valid = configured.len() == MAX_LEVEL as usize
        && configured.iter().all(|t| t.is_finite() && *t > 0.0)
        && configured.windows(2).all(|w| w[0] <= w[1]);
    if !valid {
        if !configured.is_empty() {
            tracing::warn!(
                "⚠️ Invalid nudge thresholds {:?}, using defaults {:?}",
                configured,
                DEFAULT_THRESHOLDS
            );
        }
        return DEFAULT_THRESHOLDS;
    }
    let mut out = DEFAULT_THRESHOLDS;
    out.copy_from_slice(configured);
    out
}
