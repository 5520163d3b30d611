//! Registration sequence: CAP negotiation, SASL, NICK/USER, alt-nick
//! fallback.
//!
//! Runs between transport establishment and the 001 welcome. The
//! machine consumes inbound messages and emits raw lines to send; the
//! connection loop owns timing and the queue.

use munin_proto::{numeric, sasl, Command, Message};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Capabilities requested whenever the server advertises them.
const WANTED_CAPS: &[&str] = &[
    "multi-prefix",
    "away-notify",
    "account-notify",
    "account-tag",
    "extended-join",
    "chghost",
    "batch",
    "server-time",
    "message-tags",
];

/// Total nickname attempts before giving up (desired + alternates +
/// suffixed fallbacks).
const MAX_NICK_ATTEMPTS: u32 = 6;

#[derive(Debug, Clone)]
pub struct RegistrationOptions {
    pub nickname: String,
    pub alt_nicknames: Vec<String>,
    pub username: String,
    pub realname: String,
    pub server_password: Option<Zeroizing<String>>,
    pub sasl: Option<SaslOptions>,
}

#[derive(Debug, Clone)]
pub struct SaslOptions {
    pub username: String,
    pub password: Zeroizing<String>,
    pub required: bool,
}

/// Something the connection loop must act on.
#[derive(Debug, PartialEq, Eq)]
pub enum RegEvent {
    /// 001 received; the session nick is final.
    Registered { nick: String },
    /// Registration cannot proceed (SASL required and failed, server
    /// password rejected, nicknames exhausted).
    Failed { reason: String },
}

#[derive(Debug)]
pub struct Registration {
    opts: RegistrationOptions,
    /// Nick we most recently asked for.
    pub current_nick: String,
    nick_attempts: u32,
    alt_index: usize,
    cap_ls_sent: bool,
    cap_end_sent: bool,
    sasl_pending: bool,
}

impl Registration {
    pub fn new(opts: RegistrationOptions) -> Registration {
        let current_nick = opts.nickname.clone();
        Registration {
            opts,
            current_nick,
            nick_attempts: 1,
            alt_index: 0,
            cap_ls_sent: false,
            cap_end_sent: false,
            sasl_pending: false,
        }
    }

    /// Opening burst: CAP LS, optional PASS, NICK, USER.
    pub fn start(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        self.cap_ls_sent = true;
        lines.push("CAP LS 302".to_string());
        if let Some(pass) = &self.opts.server_password {
            lines.push(Command::Pass(pass.to_string()).to_string());
        }
        lines.push(Command::Nick(self.current_nick.clone()).to_string());
        lines.push(
            Command::User {
                user: self.opts.username.clone(),
                mode: "0".to_string(),
                realname: self.opts.realname.clone(),
            }
            .to_string(),
        );
        lines
    }

    fn cap_end(&mut self, lines: &mut Vec<String>) {
        if self.cap_ls_sent && !self.cap_end_sent {
            self.cap_end_sent = true;
            lines.push("CAP END".to_string());
        }
    }

    fn next_nick(&mut self) -> Option<String> {
        self.nick_attempts += 1;
        if self.nick_attempts > MAX_NICK_ATTEMPTS {
            return None;
        }
        let candidate = if self.alt_index < self.opts.alt_nicknames.len() {
            let alt = self.opts.alt_nicknames[self.alt_index].clone();
            self.alt_index += 1;
            alt
        } else {
            // Out of configured alternates: suffix the desired nick.
            format!("{}_", self.current_nick)
        };
        self.current_nick = candidate.clone();
        Some(candidate)
    }

    /// Feed one inbound message. Returns lines to send plus an optional
    /// terminal event.
    pub fn on_message(&mut self, msg: &Message) -> (Vec<String>, Option<RegEvent>) {
        let mut lines = Vec::new();
        let mut event = None;

        match &msg.command {
            Command::Cap(params) => self.on_cap(params, &mut lines, &mut event),
            Command::Authenticate(payload) if payload == "+" => {
                if let Some(sasl_opts) = &self.opts.sasl {
                    let payload = sasl::plain_payload(&sasl_opts.username, &sasl_opts.password);
                    for chunk in sasl::chunk_payload(&payload) {
                        lines.push(Command::Authenticate(chunk).to_string());
                    }
                }
            }
            Command::Response(code, params) => {
                self.on_numeric(*code, params, &mut lines, &mut event)
            }
            _ => {}
        }

        (lines, event)
    }

    fn on_cap(&mut self, params: &[String], lines: &mut Vec<String>, event: &mut Option<RegEvent>) {
        // CAP <target> <subcmd> [*] :<caps>
        let Some(subcmd) = params.get(1) else { return };
        let multiline = params.get(2).is_some_and(|p| p == "*");
        let caps = params.last().cloned().unwrap_or_default();

        match subcmd.as_str() {
            "LS" => {
                if multiline {
                    // More LS lines coming; wait for the last one.
                    return;
                }
                let advertised: Vec<&str> =
                    caps.split(' ').map(|c| c.split('=').next().unwrap_or(c)).collect();
                let mut request: Vec<&str> = WANTED_CAPS
                    .iter()
                    .copied()
                    .filter(|want| advertised.contains(want))
                    .collect();
                if self.opts.sasl.is_some() && advertised.contains(&"sasl") {
                    request.push("sasl");
                }
                if request.is_empty() {
                    self.cap_end(lines);
                } else {
                    lines.push(format!("CAP REQ :{}", request.join(" ")));
                }
            }
            "ACK" => {
                if caps.split(' ').any(|c| c == "sasl") && self.opts.sasl.is_some() {
                    self.sasl_pending = true;
                    lines.push(Command::Authenticate("PLAIN".to_string()).to_string());
                } else {
                    self.cap_end(lines);
                }
            }
            "NAK" => {
                warn!(caps = %caps, "server refused capabilities");
                if self.sasl_required() {
                    *event = Some(RegEvent::Failed {
                        reason: "sasl capability refused".to_string(),
                    });
                }
                self.cap_end(lines);
            }
            _ => {}
        }
    }

    fn sasl_required(&self) -> bool {
        self.opts.sasl.as_ref().is_some_and(|s| s.required)
    }

    fn on_numeric(
        &mut self,
        code: u16,
        params: &[String],
        lines: &mut Vec<String>,
        event: &mut Option<RegEvent>,
    ) {
        match code {
            numeric::RPL_WELCOME => {
                // The server has the final say on our nick.
                if let Some(nick) = params.first() {
                    self.current_nick = nick.clone();
                }
                *event = Some(RegEvent::Registered {
                    nick: self.current_nick.clone(),
                });
            }
            numeric::RPL_SASLSUCCESS | numeric::RPL_LOGGEDIN => {
                if self.sasl_pending {
                    self.sasl_pending = false;
                    if code == numeric::RPL_SASLSUCCESS {
                        debug!("sasl authentication succeeded");
                        self.cap_end(lines);
                    }
                }
            }
            numeric::ERR_SASLFAIL | numeric::ERR_SASLTOOLONG => {
                self.sasl_pending = false;
                if self.sasl_required() {
                    *event = Some(RegEvent::Failed {
                        reason: format!("sasl authentication failed ({})", code),
                    });
                } else {
                    warn!(code, "sasl failed, continuing without");
                    self.cap_end(lines);
                }
            }
            numeric::ERR_NICKNAMEINUSE | numeric::ERR_ERRONEUSNICKNAME => {
                match self.next_nick() {
                    Some(nick) => lines.push(Command::Nick(nick).to_string()),
                    None => {
                        *event = Some(RegEvent::Failed {
                            reason: "NicknameExhausted".to_string(),
                        })
                    }
                }
            }
            numeric::ERR_PASSWDMISMATCH => {
                *event = Some(RegEvent::Failed {
                    reason: "server password rejected".to_string(),
                });
            }
            _ => {}
        }
    }
}
