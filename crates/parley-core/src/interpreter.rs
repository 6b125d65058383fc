//! Choice interpreter
//!
//! Resolves free-form message text against a target action's parameter
//! schema. This is the single authority for argument resolution; there is
//! no separate keyword or fuzzy fallback path anywhere else.
//!
//! Resolution precedence per parameter:
//! 1. Exact match against an enumerated option
//! 2. Paraphrase (alias) match
//! 3. Ordinal reference ("the second one")
//! 4. Numeric coercion (digits, spelled-out numbers, k/m magnitudes)
//! 5. Fallback token-overlap at degraded confidence
//!
//! When no candidate clears the confidence threshold the interpreter
//! produces exactly one concise clarifying question naming the missing
//! parameter and its valid options, never a second round of silent
//! guessing, and never both a dispatch and a clarifier.

use crate::catalog::{ActionSpec, ParamSchema, ParamSpec};
use crate::conversation::Conversation;
use crate::events::{CoreEvent, EventEmitter};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Words that signal the user is hedging rather than choosing.
const HEDGE_MARKERS: &[&str] = &[
    "maybe",
    "perhaps",
    "possibly",
    "not sure",
    "or something",
    "i guess",
    "dunno",
    "whatever",
    "idk",
];

/// Confidence multiplier applied when the message hedges.
const HEDGE_PENALTY: f32 = 0.5;

/// How a resolved value was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    /// Verbatim option match
    Exact,
    /// Alias / paraphrase match
    Paraphrase,
    /// Positional reference into the option list
    Ordinal,
    /// Digits or spelled-out quantity
    NumericCoercion,
    /// Degraded-confidence heuristic
    Fallback,
}

impl MatchedBy {
    /// Returns the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Paraphrase => "paraphrase",
            Self::Ordinal => "ordinal",
            Self::NumericCoercion => "numeric_coercion",
            Self::Fallback => "fallback",
        }
    }
}

/// A typed resolved parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ArgValue {
    /// One of an enumerated option set
    Choice(String),
    /// A coerced quantity
    Number(f64),
    /// Free text
    Text(String),
}

impl ArgValue {
    /// JSON representation for handler dispatch and context updates
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Choice(s) | Self::Text(s) => serde_json::json!(s),
            Self::Number(n) => serde_json::json!(n),
        }
    }

    /// String view for Choice/Text values
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Choice(s) | Self::Text(s) => Some(s),
            Self::Number(_) => None,
        }
    }
}

/// Arguments resolved for one action dispatch.
///
/// Either complete and above threshold (dispatchable), or carrying exactly
/// one clarifying question, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedArguments {
    /// Target action
    pub action: String,
    /// Resolved parameter values
    pub values: HashMap<String, ArgValue>,
    /// Overall confidence (minimum across resolved parameters)
    pub confidence: f32,
    /// How the weakest resolved parameter matched
    pub matched_by: MatchedBy,
    /// The single clarifying question, present only when not dispatchable
    pub clarifier: Option<String>,
}

impl ResolvedArguments {
    /// Arguments for an action with no parameters
    #[must_use]
    pub fn empty(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            values: HashMap::new(),
            confidence: 1.0,
            matched_by: MatchedBy::Exact,
            clarifier: None,
        }
    }

    fn resolved(
        action: &str,
        values: HashMap<String, ArgValue>,
        confidence: f32,
        matched_by: MatchedBy,
    ) -> Self {
        Self {
            action: action.to_string(),
            values,
            confidence,
            matched_by,
            clarifier: None,
        }
    }

    fn needs_clarification(action: &str, confidence: f32, question: String) -> Self {
        Self {
            action: action.to_string(),
            values: HashMap::new(),
            confidence,
            matched_by: MatchedBy::Fallback,
            clarifier: Some(question),
        }
    }

    /// Whether dispatch may proceed
    #[must_use]
    pub fn is_dispatchable(&self) -> bool {
        self.clarifier.is_none()
    }

    /// Get a resolved value by parameter name
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&ArgValue> {
        self.values.get(name)
    }
}

/// Configuration for the interpreter
#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    /// Minimum confidence for dispatch; below it a clarifier is issued
    pub confidence_threshold: f32,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.65,
        }
    }
}

/// The choice interpreter.
pub struct ChoiceInterpreter {
    config: InterpreterConfig,
    emitter: EventEmitter,
    number_re: Regex,
}

impl ChoiceInterpreter {
    /// Create an interpreter
    #[must_use]
    pub fn new(config: InterpreterConfig, emitter: EventEmitter) -> Self {
        Self {
            config,
            emitter,
            number_re: Regex::new(r"(?i)\b(\d+(?:\.\d+)?)\s*([km])?\b").expect("static pattern"),
        }
    }

    /// Resolve the action's parameters from the message and conversation
    /// context. Never mutates state; emits one choice event per call.
    #[instrument(skip(self, spec, conversation), fields(action = %spec.name, conversation_id = %conversation.id))]
    pub fn resolve(
        &self,
        spec: &ActionSpec,
        message: &str,
        conversation: &Conversation,
        correlation_id: Uuid,
    ) -> ResolvedArguments {
        let result = self.resolve_inner(spec, message, conversation);

        self.emitter.emit(CoreEvent::Choice {
            conversation_id: conversation.id.clone(),
            correlation_id,
            action: spec.name.clone(),
            confidence: result.confidence,
            matched_by: result.matched_by.as_str().to_string(),
            clarified: result.clarifier.is_some(),
        });

        result
    }

    fn resolve_inner(
        &self,
        spec: &ActionSpec,
        message: &str,
        conversation: &Conversation,
    ) -> ResolvedArguments {
        if spec.params.is_empty() {
            return ResolvedArguments::empty(&spec.name);
        }

        let lowered = message.to_lowercase();
        let penalty = if HEDGE_MARKERS.iter().any(|m| lowered.contains(m)) {
            HEDGE_PENALTY
        } else {
            1.0
        };

        let mut values = HashMap::new();
        // Minimum confidence among accepted values; stays at or above the
        // threshold by construction
        let mut weakest: Option<(f32, MatchedBy)> = None;
        // Best score among rejected candidates, reported with a clarifier
        let mut rejected: Option<f32> = None;
        let mut first_unresolved: Option<&ParamSpec> = None;

        for param in &spec.params {
            let candidate = self
                .resolve_param(param, &lowered, message)
                .or_else(|| context_fallback(param, conversation));

            match candidate {
                Some((value, raw_confidence, matched_by)) => {
                    let confidence = raw_confidence * penalty;
                    debug!(
                        param = %param.name,
                        confidence = confidence,
                        matched_by = matched_by.as_str(),
                        "parameter candidate"
                    );
                    if confidence < self.config.confidence_threshold {
                        first_unresolved.get_or_insert(param);
                        rejected = Some(rejected.map_or(confidence, |c| c.max(confidence)));
                        continue;
                    }
                    if weakest.map_or(true, |(c, _)| confidence < c) {
                        weakest = Some((confidence, matched_by));
                    }
                    values.insert(param.name.clone(), value);
                }
                None if param.required => {
                    first_unresolved.get_or_insert(param);
                }
                None => {}
            }
        }

        let missing_required = spec
            .params
            .iter()
            .filter(|p| p.required)
            .any(|p| !values.contains_key(&p.name));

        if missing_required {
            let param = first_unresolved
                .or_else(|| spec.params.iter().find(|p| p.required))
                .expect("at least one required parameter");
            return ResolvedArguments::needs_clarification(
                &spec.name,
                rejected.unwrap_or(0.0),
                clarifying_question(param),
            );
        }

        let (confidence, matched_by) = weakest.unwrap_or((1.0, MatchedBy::Exact));
        ResolvedArguments::resolved(&spec.name, values, confidence, matched_by)
    }

    fn resolve_param(
        &self,
        param: &ParamSpec,
        lowered: &str,
        original: &str,
    ) -> Option<(ArgValue, f32, MatchedBy)> {
        match &param.schema {
            ParamSchema::Choice { options, aliases } => {
                self.resolve_choice(options, aliases, lowered)
            }
            ParamSchema::Number { min, max } => self.resolve_number(lowered, *min, *max),
            ParamSchema::Text { pattern } => resolve_text(original, pattern.as_deref()),
        }
    }

    fn resolve_choice(
        &self,
        options: &[String],
        aliases: &HashMap<String, String>,
        lowered: &str,
    ) -> Option<(ArgValue, f32, MatchedBy)> {
        // 1. Exact option named in the message
        for option in options {
            if contains_word(lowered, &option.to_lowercase()) {
                return Some((ArgValue::Choice(option.clone()), 0.95, MatchedBy::Exact));
            }
        }

        // 2. Paraphrase alias
        for (alias, option) in aliases {
            if lowered.contains(alias.as_str()) && options.contains(option) {
                return Some((ArgValue::Choice(option.clone()), 0.85, MatchedBy::Paraphrase));
            }
        }

        // 3. Ordinal reference into the option list
        if let Some(index) = parse_ordinal(lowered, options.len()) {
            return Some((
                ArgValue::Choice(options[index].clone()),
                0.8,
                MatchedBy::Ordinal,
            ));
        }

        // 4. Degraded prefix overlap ("tert" → "tertiary")
        for token in lowered.split(|c: char| !c.is_alphanumeric()) {
            if token.len() < 4 {
                continue;
            }
            for option in options {
                let option_lower = option.to_lowercase();
                if option_lower.starts_with(token) && option_lower != token {
                    return Some((ArgValue::Choice(option.clone()), 0.5, MatchedBy::Fallback));
                }
            }
        }

        None
    }

    fn resolve_number(
        &self,
        lowered: &str,
        min: Option<f64>,
        max: Option<f64>,
    ) -> Option<(ArgValue, f32, MatchedBy)> {
        let (value, confidence) = if let Some(caps) = self.number_re.captures(lowered) {
            let base: f64 = caps.get(1)?.as_str().parse().ok()?;
            let scaled = match caps.get(2).map(|m| m.as_str().to_lowercase()) {
                Some(ref s) if s == "k" => base * 1_000.0,
                Some(ref s) if s == "m" => base * 1_000_000.0,
                _ => base,
            };
            (scaled, 0.9)
        } else if let Some(value) = parse_spelled_number(lowered) {
            (value, 0.8)
        } else {
            return None;
        };

        if min.is_some_and(|m| value < m) || max.is_some_and(|m| value > m) {
            return None;
        }
        Some((ArgValue::Number(value), confidence, MatchedBy::NumericCoercion))
    }
}

/// Context-bag fallback: a previously collected value for this parameter
/// is accepted at degraded confidence when the message itself yields
/// nothing.
fn context_fallback(
    param: &ParamSpec,
    conversation: &Conversation,
) -> Option<(ArgValue, f32, MatchedBy)> {
    let value = conversation.context_value(&param.name)?;
    let arg = match (&param.schema, value) {
        (ParamSchema::Choice { options, .. }, serde_json::Value::String(s))
            if options.contains(s) =>
        {
            ArgValue::Choice(s.clone())
        }
        (ParamSchema::Number { .. }, serde_json::Value::Number(n)) => {
            ArgValue::Number(n.as_f64()?)
        }
        (ParamSchema::Text { .. }, serde_json::Value::String(s)) => ArgValue::Text(s.clone()),
        _ => return None,
    };
    Some((arg, 0.75, MatchedBy::Fallback))
}

fn resolve_text(original: &str, pattern: Option<&str>) -> Option<(ArgValue, f32, MatchedBy)> {
    if let Some(pattern) = pattern {
        let re = Regex::new(pattern).ok()?;
        let matched = re.find(original)?;
        return Some((
            ArgValue::Text(matched.as_str().to_string()),
            0.9,
            MatchedBy::Exact,
        ));
    }
    let trimmed = original.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some((ArgValue::Text(trimmed.to_string()), 0.7, MatchedBy::Fallback))
    }
}

/// Whether `word` appears with boundaries in `text`.
fn contains_word(text: &str, word: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .any(|token| token == word)
}

/// Parse an ordinal reference ("second", "2nd", "last") into an index
/// within `len` options.
fn parse_ordinal(lowered: &str, len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    const WORDS: &[(&str, usize)] = &[
        ("first", 0),
        ("1st", 0),
        ("second", 1),
        ("2nd", 1),
        ("third", 2),
        ("3rd", 2),
        ("fourth", 3),
        ("4th", 3),
        ("fifth", 4),
        ("5th", 4),
    ];
    for (word, index) in WORDS {
        if contains_word(lowered, word) && *index < len {
            return Some(*index);
        }
    }
    if contains_word(lowered, "last") {
        return Some(len - 1);
    }
    None
}

/// Parse a small spelled-out quantity.
fn parse_spelled_number(lowered: &str) -> Option<f64> {
    const WORDS: &[(&str, f64)] = &[
        ("zero", 0.0),
        ("one", 1.0),
        ("two", 2.0),
        ("three", 3.0),
        ("four", 4.0),
        ("five", 5.0),
        ("six", 6.0),
        ("seven", 7.0),
        ("eight", 8.0),
        ("nine", 9.0),
        ("ten", 10.0),
        ("eleven", 11.0),
        ("twelve", 12.0),
        ("fifteen", 15.0),
        ("twenty", 20.0),
        ("thirty", 30.0),
        ("forty", 40.0),
        ("fifty", 50.0),
        ("hundred", 100.0),
        ("dozen", 12.0),
    ];
    for (word, value) in WORDS {
        if contains_word(lowered, word) {
            return Some(*value);
        }
    }
    None
}

/// Build the single clarifying question for an unresolved parameter.
fn clarifying_question(param: &ParamSpec) -> String {
    match &param.schema {
        ParamSchema::Choice { options, .. } => format!(
            "Which {}? Valid options: {}.",
            param.description,
            options.join(", ")
        ),
        ParamSchema::Number { min, max } => {
            let range = match (min, max) {
                (Some(lo), Some(hi)) => format!(" (between {} and {})", lo, hi),
                (Some(lo), None) => format!(" (at least {})", lo),
                (None, Some(hi)) => format!(" (at most {})", hi),
                (None, None) => String::new(),
            };
            format!("What value for {}{}?", param.description, range)
        }
        ParamSchema::Text { .. } => format!("Please provide {}.", param.description),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ActionSpec;

    fn tier_spec() -> ActionSpec {
        ActionSpec::new("choose_facility_tier", "Pick a facility tier").with_param(
            ParamSpec::choice(
                "tier",
                "facility tier",
                &["primary", "secondary", "tertiary", "all"],
            )
            .with_alias("first-level", "primary")
            .with_alias("district hospitals", "secondary"),
        )
    }

    fn interpreter() -> ChoiceInterpreter {
        ChoiceInterpreter::new(InterpreterConfig::default(), EventEmitter::new(16))
    }

    fn resolve(spec: &ActionSpec, message: &str) -> ResolvedArguments {
        let conv = Conversation::new("c1");
        interpreter().resolve(spec, message, &conv, Uuid::new_v4())
    }

    #[test]
    fn test_exact_option_match() {
        let args = resolve(&tier_spec(), "tertiary please");
        assert!(args.is_dispatchable());
        assert_eq!(args.value("tier"), Some(&ArgValue::Choice("tertiary".to_string())));
        assert_eq!(args.matched_by, MatchedBy::Exact);
    }

    #[test]
    fn test_ordinal_reference_resolves_second() {
        let args = resolve(&tier_spec(), "go with the second one");
        assert!(args.is_dispatchable());
        assert_eq!(
            args.value("tier"),
            Some(&ArgValue::Choice("secondary".to_string()))
        );
        assert_eq!(args.matched_by, MatchedBy::Ordinal);
        assert!(args.confidence >= 0.65);
    }

    #[test]
    fn test_hedged_message_yields_single_clarifier() {
        let args = resolve(&tier_spec(), "maybe all of them or something");
        assert!(!args.is_dispatchable());
        let question = args.clarifier.as_ref().expect("clarifier expected");
        for option in ["primary", "secondary", "tertiary", "all"] {
            assert!(question.contains(option), "question missing {}", option);
        }
        assert!(args.values.is_empty());
    }

    #[test]
    fn test_paraphrase_alias() {
        let args = resolve(&tier_spec(), "the district hospitals please");
        assert!(args.is_dispatchable());
        assert_eq!(
            args.value("tier"),
            Some(&ArgValue::Choice("secondary".to_string()))
        );
        assert_eq!(args.matched_by, MatchedBy::Paraphrase);
    }

    #[test]
    fn test_last_ordinal() {
        let args = resolve(&tier_spec(), "the last option");
        assert_eq!(args.value("tier"), Some(&ArgValue::Choice("all".to_string())));
    }

    #[test]
    fn test_prefix_fallback_below_threshold() {
        let args = resolve(&tier_spec(), "the tert ones");
        // Prefix overlap resolves the value but at degraded confidence,
        // so a clarifier is issued instead of a dispatch.
        assert!(!args.is_dispatchable());
        assert!(args.clarifier.is_some());
    }

    #[test]
    fn test_numeric_coercion() {
        let spec = ActionSpec::new("top_facilities", "Show top facilities").with_param(
            ParamSpec::new(
                "count",
                "how many facilities to show",
                ParamSchema::Number {
                    min: Some(1.0),
                    max: Some(100.0),
                },
            ),
        );

        let args = resolve(&spec, "show me the top 5");
        assert_eq!(args.value("count"), Some(&ArgValue::Number(5.0)));
        assert_eq!(args.matched_by, MatchedBy::NumericCoercion);

        let spelled = resolve(&spec, "show me the top five");
        assert_eq!(spelled.value("count"), Some(&ArgValue::Number(5.0)));
    }

    #[test]
    fn test_magnitude_suffix() {
        let spec = ActionSpec::new("sample", "Sample rows").with_param(ParamSpec::new(
            "rows",
            "row count",
            ParamSchema::Number { min: None, max: None },
        ));
        let args = resolve(&spec, "sample 5k rows");
        assert_eq!(args.value("rows"), Some(&ArgValue::Number(5000.0)));
    }

    #[test]
    fn test_out_of_range_number_clarifies_with_bounds() {
        let spec = ActionSpec::new("top_facilities", "Show top facilities").with_param(
            ParamSpec::new(
                "count",
                "how many facilities to show",
                ParamSchema::Number {
                    min: Some(1.0),
                    max: Some(20.0),
                },
            ),
        );
        let args = resolve(&spec, "show me the top 500");
        assert!(!args.is_dispatchable());
        let question = args.clarifier.unwrap();
        assert!(question.contains("between 1 and 20"));
    }

    #[test]
    fn test_context_bag_fallback() {
        let spec = tier_spec();
        let mut conv = Conversation::new("c1");
        conv.context
            .insert("tier".to_string(), serde_json::json!("primary"));

        let args = interpreter().resolve(&spec, "use what I picked before", &conv, Uuid::new_v4());
        assert!(args.is_dispatchable());
        assert_eq!(
            args.value("tier"),
            Some(&ArgValue::Choice("primary".to_string()))
        );
        assert_eq!(args.matched_by, MatchedBy::Fallback);
    }

    #[test]
    fn test_clarifier_and_dispatch_are_exclusive() {
        for message in [
            "tertiary",
            "the second one",
            "maybe all of them or something",
            "no idea honestly",
        ] {
            let args = resolve(&tier_spec(), message);
            assert!(
                args.is_dispatchable() != args.clarifier.is_some(),
                "clarifier/dispatch invariant violated for: {}",
                message
            );
        }
    }

    #[test]
    fn test_no_params_is_dispatchable() {
        let spec = ActionSpec::new("help", "Show help");
        let args = resolve(&spec, "help me out");
        assert!(args.is_dispatchable());
        assert_eq!(args.confidence, 1.0);
    }

    #[test]
    fn test_multi_param_first_unresolved_wins() {
        let spec = ActionSpec::new("filter", "Filter data")
            .with_param(ParamSpec::choice("tier", "facility tier", &["primary", "secondary"]))
            .with_param(ParamSpec::choice("band", "age band", &["children", "adults"]));

        let args = resolve(&spec, "primary facilities please");
        assert!(!args.is_dispatchable());
        // Exactly one question, and it names the unresolved parameter
        let question = args.clarifier.unwrap();
        assert!(question.contains("age band"));
        assert!(!question.contains("facility tier"));
    }

    #[test]
    fn test_event_emitted_per_resolution() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();
        let interp = ChoiceInterpreter::new(InterpreterConfig::default(), emitter);

        let conv = Conversation::new("c1");
        let id = Uuid::new_v4();
        interp.resolve(&tier_spec(), "tertiary", &conv, id);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.correlation_id(), id);
        match event {
            CoreEvent::Choice { clarified, .. } => assert!(!clarified),
            other => panic!("expected choice event, got: {:?}", other),
        }
    }
}
