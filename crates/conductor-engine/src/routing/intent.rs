use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::EngineError;

pub const INTENT_ESCALATE: &str = "escalate_to_human";
pub const INTENT_ORDER: &str = "order_inquiry";
pub const INTENT_GREETING: &str = "greeting";
pub const INTENT_UNKNOWN: &str = "unknown";

const ESCALATE_KEYWORDS: &[&str] = &[
    "转人工",
    "人工客服",
    "人工服务",
    "找人工",
    "真人",
    "真人客服",
    "活人",
    "转接人工",
    "联系客服",
    "客服电话",
    "人工坐席",
    "human agent",
    "talk to a human",
    "real person",
];

const ORDER_KEYWORDS: &[&str] = &[
    "订单", "订单号", "我的订单", "查订单", "退款", "退货", "发货", "物流", "快递", "支付", "付款",
    "付款状态", "order", "refund", "shipping", "tracking",
];

const ORDER_PATTERNS: &[&str] = &[r"#?\d{6,20}", r"(?i)order[_\-]?id"];

const GREETING_KEYWORDS: &[&str] = &[
    "你好", "您好", "hi", "hello", "嗨", "早上好", "下午好", "晚上好", "早",
];

/// One keyword/pattern rule. Keywords are stored lowercase and matched as
/// substrings of the lowercased query; patterns run against the raw query.
#[derive(Clone, Debug)]
pub struct IntentRule {
    intent: String,
    keywords: Vec<String>,
    patterns: Vec<Regex>,
    skip_analysis: bool,
}

impl IntentRule {
    pub fn new<K, S>(
        intent: impl Into<String>,
        keywords: K,
        patterns: &[&str],
        skip_analysis: bool,
    ) -> Result<Self, EngineError>
    where
        K: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_parts(intent, keywords, patterns, skip_analysis))
    }

    fn from_parts<K, S>(
        intent: impl Into<String>,
        keywords: K,
        patterns: Vec<Regex>,
        skip_analysis: bool,
    ) -> Self
    where
        K: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            intent: intent.into(),
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().to_lowercase())
                .collect(),
            patterns,
            skip_analysis,
        }
    }

    pub fn intent(&self) -> &str {
        &self.intent
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(Regex::as_str)
    }

    pub fn skips_analysis(&self) -> bool {
        self.skip_analysis
    }

    fn check(&self, lowered: &str, raw: &str) -> Option<String> {
        if let Some(kw) = self.keywords.iter().find(|kw| lowered.contains(kw.as_str())) {
            return Some(format!("keyword match: {kw}"));
        }
        self.patterns
            .iter()
            .find(|re| re.is_match(raw))
            .map(|re| format!("pattern match: {}", re.as_str()))
    }
}

/// Outcome of the fast-path classifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntentMatch {
    pub intent: String,
    pub matched: bool,
    pub skip_analysis: bool,
    pub reason: String,
}

impl IntentMatch {
    fn unknown() -> Self {
        Self {
            intent: INTENT_UNKNOWN.to_string(),
            matched: false,
            skip_analysis: false,
            reason: "no rule matched, needs model analysis".to_string(),
        }
    }
}

/// Rule-based first-match classifier. Rules are checked in insertion order
/// and the first hit wins; there is no scoring across rules.
pub struct IntentRouter {
    rules: RwLock<Vec<IntentRule>>,
}

impl IntentRouter {
    /// Router with the built-in escalate / order / greeting rules.
    pub fn new() -> Self {
        Self::with_rules(builtin_rules())
    }

    pub fn with_rules(rules: Vec<IntentRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    pub fn classify(&self, query: &str) -> IntentMatch {
        let lowered = query.to_lowercase();
        let rules = self.rules.read();
        for rule in rules.iter() {
            if let Some(reason) = rule.check(&lowered, query) {
                debug!(intent = %rule.intent, %reason, "intent fast-path hit");
                return IntentMatch {
                    intent: rule.intent.clone(),
                    matched: true,
                    skip_analysis: rule.skip_analysis,
                    reason,
                };
            }
        }
        IntentMatch::unknown()
    }

    /// Append a rule. It is checked after every existing rule.
    pub fn add_rule(&self, rule: IntentRule) {
        self.rules.write().push(rule);
    }

    /// Extend an existing intent's keywords, or add a non-skipping rule for
    /// an intent not seen before.
    pub fn add_keywords<K, S>(&self, intent: &str, keywords: K)
    where
        K: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = self.rules.write();
        let lowered = keywords.into_iter().map(|k| k.as_ref().to_lowercase());
        match rules.iter_mut().find(|r| r.intent == intent) {
            Some(rule) => rule.keywords.extend(lowered),
            None => rules.push(IntentRule::from_parts(
                intent,
                lowered.collect::<Vec<_>>(),
                Vec::new(),
                false,
            )),
        }
    }

    /// Snapshot of the current rule list.
    pub fn rules(&self) -> Vec<IntentRule> {
        self.rules.read().clone()
    }
}

impl Default for IntentRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn builtin_rules() -> Vec<IntentRule> {
    let order_patterns = ORDER_PATTERNS
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern = p, error = %e, "skipping built-in intent pattern");
                None
            }
        })
        .collect();
    vec![
        IntentRule::from_parts(INTENT_ESCALATE, ESCALATE_KEYWORDS, Vec::new(), true),
        IntentRule::from_parts(INTENT_ORDER, ORDER_KEYWORDS, order_patterns, false),
        IntentRule::from_parts(INTENT_GREETING, GREETING_KEYWORDS, Vec::new(), true),
    ]
}
