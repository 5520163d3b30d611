//! Trigger template expansion.
//!
//! Case-sensitive curly placeholders; `{{` and `}}` escape to literal
//! braces; unknown placeholders expand to the empty string.

use std::collections::HashMap;

use chrono::Local;

/// Values available to one expansion.
#[derive(Debug, Default, Clone)]
pub struct ExpandContext {
    pub server: String,
    pub nick: String,
    pub channel: String,
    pub text: String,
    pub me: String,
    /// Everything after the matched command token.
    pub args: String,
    /// Event-specific extras (`oldnick`, `topic`, `kicker`, ...).
    pub extra: HashMap<&'static str, String>,
}

impl ExpandContext {
    fn lookup(&self, key: &str) -> Option<String> {
        match key {
            "server" => Some(self.server.clone()),
            "nick" => Some(self.nick.clone()),
            "channel" => Some(self.channel.clone()),
            "text" => Some(self.text.clone()),
            "me" => Some(self.me.clone()),
            "args" => Some(self.args.clone()),
            "time" => Some(Local::now().format("%H:%M:%S").to_string()),
            "date" => Some(Local::now().format("%Y-%m-%d").to_string()),
            _ => {
                if key.len() == 1 {
                    if let Some(d) = key.chars().next().and_then(|c| c.to_digit(10)) {
                        if (1..=9).contains(&d) {
                            return Some(
                                self.args
                                    .split_whitespace()
                                    .nth(d as usize - 1)
                                    .unwrap_or_default()
                                    .to_string(),
                            );
                        }
                    }
                }
                self.extra.get(key).cloned()
            }
        }
    }
}

/// Expand a template against a context.
pub fn expand(template: &str, ctx: &ExpandContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut key = String::new();
                let mut closed = false;
                for k in chars.by_ref() {
                    if k == '}' {
                        closed = true;
                        break;
                    }
                    key.push(k);
                }
                if closed {
                    if let Some(value) = ctx.lookup(&key) {
                        out.push_str(&value);
                    }
                    // Unknown placeholder: empty string.
                } else {
                    // Unterminated brace: keep it literal.
                    out.push('{');
                    out.push_str(&key);
                }
            }
            '}' => {
                if chars.peek() == Some(&'}') {
                    chars.next();
                }
                out.push('}');
            }
            c => out.push(c),
        }
    }
    out
}
