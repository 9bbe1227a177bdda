use crate::counters::parse_counters;
use crate::error::ParseErrorKind;
use ipx_core::Rule;

/// A rule line split into its owning chain and the rule itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleLine {
    pub chain: String,
    pub rule: Rule,
}

/// Token scanner for `[packets:bytes] -A <chain> <flags...>` lines.
///
/// The scan never stops early so a bad counter token and a missing
/// `-A` pair on the same line are both reported.
#[derive(Debug, Default)]
pub struct RuleTokenizer<'a> {
    seen: usize,
    counters: Option<(u64, u64)>,
    chain: Option<&'a str>,
    awaiting_chain: bool,
    flags: Vec<&'a str>,
}

impl<'a> RuleTokenizer<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_token(&mut self, token: &'a str) {
        self.seen += 1;

        // the leading token is always the counter slot
        if self.seen == 1 {
            self.counters = parse_counters(token);
            return;
        }

        if self.awaiting_chain {
            self.awaiting_chain = false;
            self.chain = Some(token);
            return;
        }

        // only the first -A selects the chain, later ones are plain flags
        if token == "-A" && self.chain.is_none() {
            self.awaiting_chain = true;
            return;
        }

        self.flags.push(token);
    }

    pub fn finish(self) -> Result<RuleLine, Vec<ParseErrorKind>> {
        let mut errors = Vec::new();
        if self.counters.is_none() {
            errors.push(ParseErrorKind::MalformedCounters);
        }
        if self.chain.is_none() {
            errors.push(ParseErrorKind::MissingTarget);
        }

        match (self.counters, self.chain) {
            (Some((packets, bytes)), Some(chain)) => Ok(RuleLine {
                chain: chain.to_string(),
                rule: Rule {
                    packets,
                    bytes,
                    text: self.flags.join(" "),
                },
            }),
            _ => Err(errors),
        }
    }
}

/// Tokenize one (trimmed) rule line.
pub fn tokenize_rule(line: &str) -> Result<RuleLine, Vec<ParseErrorKind>> {
    let mut tokenizer = RuleTokenizer::new();
    for token in line.split_whitespace() {
        tokenizer.handle_token(token);
    }
    tokenizer.finish()
}
