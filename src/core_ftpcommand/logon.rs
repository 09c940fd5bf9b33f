//! Connection setup: welcome, TLS upgrade, login sequence and feature
//! negotiation.

use crate::config::{ProxyConfig, ProxyKind};
use crate::core_engine::{AsyncRequest, Outbound, Step};
use crate::core_error::ReplyCode;
use crate::core_ftpcommand::control_socket::FtpControlSocket;
use crate::core_ftpcommand::ftpcommand::FtpOp;
use crate::core_server::{Capability, CapabilityValue, Charset, LogonType, Protocol, Server, ServerType};
use log::{debug, error, info, warn};
use std::collections::VecDeque;

/// Every capability FEAT can advertise. Those a successful FEAT reply does
/// not list are concluded unsupported.
const FEAT_CAPABILITIES: &[Capability] = &[
    Capability::Utf8Command,
    Capability::ClntCommand,
    Capability::MlsdCommand,
    Capability::MfmtCommand,
    Capability::MdtmCommand,
    Capability::SizeCommand,
    Capability::ModeZSupport,
    Capability::TvfsSupport,
    Capability::RestStream,
    Capability::EpsvCommand,
    Capability::AuthTlsCommand,
    Capability::AuthSslCommand,
    Capability::PretCommand,
];

const WANTED_MLST_FACTS: &[&str] = &[
    "type",
    "size",
    "modify",
    "perm",
    "unix.mode",
    "unix.owner",
    "unix.group",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogonState {
    Welcome,
    AuthTls,
    AuthSsl,
    AuthWait,
    Logon,
    Syst,
    Feat,
    Clnt,
    OptsUtf8,
    Pbsz,
    Prot,
    OptsMlst,
    CustomCommands,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum LoginKind {
    User,
    Pass,
    Account,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct LoginCommand {
    pub text: String,
    pub kind: LoginKind,
    /// Skipped when an earlier command of the sequence already got a 2xx.
    pub optional: bool,
    pub hide: bool,
}

impl LoginCommand {
    fn new(text: String, kind: LoginKind, optional: bool) -> Self {
        Self {
            text,
            hide: kind == LoginKind::Pass || kind == LoginKind::Account,
            kind,
            optional,
        }
    }
}

#[derive(Debug)]
pub struct LogonOp {
    pub state: LogonState,
    sequence: VecDeque<LoginCommand>,
    custom_commands: VecDeque<String>,
    welcome_seen: bool,
    pub(super) tls_trust_pending: bool,
    tried_local_charset: bool,
    /// Password supplied through an interactive prompt.
    prompted_password: Option<String>,
    asked_password: bool,
}

impl LogonOp {
    pub fn new() -> Self {
        Self {
            state: LogonState::Welcome,
            sequence: VecDeque::new(),
            custom_commands: VecDeque::new(),
            welcome_seen: false,
            tls_trust_pending: false,
            tried_local_charset: false,
            prompted_password: None,
            asked_password: false,
        }
    }
}

impl Default for LogonOp {
    fn default() -> Self {
        Self::new()
    }
}

fn host_with_port(server: &Server) -> String {
    if server.port == 21 {
        server.host.clone()
    } else {
        format!("{}:{}", server.host, server.port)
    }
}

/// Builds the ordered login commands for `server`, optionally through `proxy`.
pub(super) fn build_login_sequence(
    server: &Server,
    password: &str,
    proxy: Option<&ProxyConfig>,
) -> VecDeque<LoginCommand> {
    let account = server.account.clone().unwrap_or_default();
    let mut sequence = VecDeque::new();
    let push_user_login = |sequence: &mut VecDeque<LoginCommand>, user: String, pass: String| {
        sequence.push_back(LoginCommand::new(format!("USER {}", user), LoginKind::User, false));
        sequence.push_back(LoginCommand::new(format!("PASS {}", pass), LoginKind::Pass, true));
        if !account.is_empty() {
            sequence.push_back(LoginCommand::new(
                format!("ACCT {}", account),
                LoginKind::Account,
                true,
            ));
        }
    };

    let Some(proxy) = proxy else {
        push_user_login(&mut sequence, server.user.clone(), password.to_string());
        return sequence;
    };

    match proxy.kind {
        ProxyKind::UserAtHost => {
            let user = format!("{}@{}", server.user, host_with_port(server));
            push_user_login(&mut sequence, user, password.to_string());
        }
        ProxyKind::Site | ProxyKind::Open => {
            if !proxy.user.is_empty() {
                sequence.push_back(LoginCommand::new(
                    format!("USER {}", proxy.user),
                    LoginKind::Other,
                    false,
                ));
                let mut pass = LoginCommand::new(
                    format!("PASS {}", proxy.password),
                    LoginKind::Other,
                    true,
                );
                pass.hide = true;
                sequence.push_back(pass);
            }
            let verb = if proxy.kind == ProxyKind::Site { "SITE" } else { "OPEN" };
            sequence.push_back(LoginCommand::new(
                format!("{} {}", verb, host_with_port(server)),
                LoginKind::Other,
                false,
            ));
            push_user_login(&mut sequence, server.user.clone(), password.to_string());
        }
        ProxyKind::UserAtProxyAtHost => {
            let user = format!("{}@{}@{}", server.user, proxy.user, host_with_port(server));
            let pass = format!("{}@{}", password, proxy.password);
            push_user_login(&mut sequence, user, pass);
        }
        ProxyKind::Custom => {
            for line in proxy.custom_sequence.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let kind = if line.contains("%p") {
                    LoginKind::Pass
                } else if line.contains("%u") {
                    LoginKind::User
                } else {
                    LoginKind::Other
                };
                let text = line
                    .replace("%u", &server.user)
                    .replace("%p", password)
                    .replace("%a", &account)
                    .replace("%h", &host_with_port(server))
                    .replace("%s", &proxy.user)
                    .replace("%w", &proxy.password);
                let mut command = LoginCommand::new(text, kind, false);
                command.hide = line.contains("%p") || line.contains("%w") || line.contains("%a");
                sequence.push_back(command);
            }
        }
    }
    sequence
}

/// Server type named by a SYST reply, if it is one we treat specially.
pub(super) fn server_type_from_syst(text: &str) -> Option<ServerType> {
    let upper = text.to_ascii_uppercase();
    if upper.starts_with("MVS") || upper.contains("OS/390") || upper.starts_with("Z/VM") {
        Some(ServerType::Mvs)
    } else if upper.starts_with("VMS") || upper.starts_with("NONSTOP") {
        Some(ServerType::Vms)
    } else {
        None
    }
}

impl FtpControlSocket {
    pub(super) fn logon_send(&mut self, op: &mut LogonOp) -> Step<FtpOp> {
        let Some(server) = self.core.server.clone() else {
            return Step::Finish(ReplyCode::internal());
        };
        match op.state {
            LogonState::Welcome | LogonState::AuthWait => Step::Wait,
            LogonState::AuthTls => Step::Send("AUTH TLS".to_string()),
            LogonState::AuthSsl => Step::Send("AUTH SSL".to_string()),
            LogonState::Logon => {
                let Some(command) = op.sequence.front().cloned() else {
                    return Step::Finish(ReplyCode::internal());
                };
                let needs_prompt = command.kind == LoginKind::Pass
                    && server.password.is_empty()
                    && op.prompted_password.is_none()
                    && matches!(server.logon_type, LogonType::Ask | LogonType::Interactive);
                if needs_prompt && !op.asked_password {
                    op.asked_password = true;
                    self.core.send_async_request(AsyncRequest::InteractiveLogin {
                        challenge: self.reply_text().to_string(),
                    });
                    return Step::Wait;
                }
                self.send_command_masked(&command.text, command.hide);
                Step::Wait
            }
            LogonState::Syst => {
                let (value, text) = self
                    .core
                    .ctx
                    .capabilities()
                    .get_text(&server, Capability::SystCommand);
                match (value, text) {
                    (CapabilityValue::Yes, Some(text)) => {
                        self.apply_syst(&text);
                        op.state = LogonState::Feat;
                        Step::Continue
                    }
                    (CapabilityValue::No, _) => {
                        op.state = LogonState::Feat;
                        Step::Continue
                    }
                    _ => Step::Send("SYST".to_string()),
                }
            }
            LogonState::Feat => {
                if self.capability(Capability::FeatCommand) != CapabilityValue::Unknown {
                    op.state = LogonState::Clnt;
                    return Step::Continue;
                }
                Step::Send("FEAT".to_string())
            }
            LogonState::Clnt => {
                if self.capability(Capability::ClntCommand) == CapabilityValue::Yes {
                    return Step::Send(format!("CLNT {}", self.core.options.client_name));
                }
                op.state = LogonState::OptsUtf8;
                Step::Continue
            }
            LogonState::OptsUtf8 => {
                let utf8 = self.capability(Capability::Utf8Command);
                let wanted = match server.charset {
                    Charset::Local => false,
                    Charset::Auto => utf8 == CapabilityValue::Yes,
                    Charset::Utf8 => utf8 != CapabilityValue::No,
                };
                if wanted && self.use_utf8 {
                    return Step::Send("OPTS UTF8 ON".to_string());
                }
                op.state = LogonState::Pbsz;
                Step::Continue
            }
            LogonState::Pbsz => {
                if self.tls_active {
                    return Step::Send("PBSZ 0".to_string());
                }
                op.state = LogonState::OptsMlst;
                Step::Continue
            }
            LogonState::Prot => Step::Send("PROT P".to_string()),
            LogonState::OptsMlst => match self.opts_mlst_command(&server) {
                Some(command) => Step::Send(command),
                None => {
                    op.state = LogonState::CustomCommands;
                    Step::Continue
                }
            },
            LogonState::CustomCommands => match op.custom_commands.pop_front() {
                Some(command) => Step::Send(command),
                None => {
                    op.state = LogonState::Done;
                    Step::Continue
                }
            },
            LogonState::Done => {
                self.logged_on = true;
                info!("Logged in to {}", server.display_name());
                Step::Finish(ReplyCode::Ok)
            }
        }
    }

    pub(super) fn logon_parse(&mut self, op: &mut LogonOp) -> Step<FtpOp> {
        let Some(server) = self.core.server.clone() else {
            return Step::Finish(ReplyCode::internal());
        };
        let class = self.reply_class();
        match op.state {
            LogonState::Welcome => {
                if class != 2 {
                    error!("Server refused the connection: {}", self.last_reply);
                    return Step::Finish(ReplyCode::critical());
                }
                op.welcome_seen = true;
                if op.tls_trust_pending {
                    return Step::Wait;
                }
                self.logon_after_welcome(op, &server)
            }
            LogonState::AuthTls | LogonState::AuthSsl => {
                let capability = if op.state == LogonState::AuthTls {
                    Capability::AuthTlsCommand
                } else {
                    Capability::AuthSslCommand
                };
                if class == 2 || class == 3 {
                    self.set_capability(capability, CapabilityValue::Yes);
                    op.state = LogonState::AuthWait;
                    self.core.emit(Outbound::StartTls);
                    return Step::Wait;
                }
                self.set_capability(capability, CapabilityValue::No);
                if op.state == LogonState::AuthTls {
                    op.state = LogonState::AuthSsl;
                    return Step::Continue;
                }
                if server.protocol == Protocol::Ftp {
                    warn!("Server does not support TLS, continuing in plain text");
                    self.enter_login(op, &server);
                    return Step::Continue;
                }
                error!("Server does not support TLS");
                Step::Finish(ReplyCode::critical())
            }
            LogonState::Logon => self.logon_login_reply(op, &server),
            LogonState::Syst => {
                if class == 2 {
                    let text = self.reply_text().to_string();
                    self.core.ctx.capabilities().set_text(
                        &server,
                        Capability::SystCommand,
                        CapabilityValue::Yes,
                        &text,
                    );
                    self.apply_syst(&text);
                } else {
                    self.set_capability(Capability::SystCommand, CapabilityValue::No);
                }
                op.state = LogonState::Feat;
                Step::Continue
            }
            LogonState::Feat => {
                if class == 2 {
                    self.parse_feat(&server);
                } else {
                    self.set_capability(Capability::FeatCommand, CapabilityValue::No);
                }
                op.state = LogonState::Clnt;
                Step::Continue
            }
            LogonState::Clnt => {
                op.state = LogonState::OptsUtf8;
                Step::Continue
            }
            LogonState::OptsUtf8 => {
                if class == 2 {
                    self.use_utf8 = true;
                } else if server.charset == Charset::Auto {
                    debug!("OPTS UTF8 ON rejected");
                }
                op.state = LogonState::Pbsz;
                Step::Continue
            }
            LogonState::Pbsz => {
                op.state = LogonState::Prot;
                Step::Continue
            }
            LogonState::Prot => {
                self.protect_data = class == 2;
                if !self.protect_data {
                    warn!("Server refused protected data connections");
                }
                op.state = LogonState::OptsMlst;
                Step::Continue
            }
            LogonState::OptsMlst => {
                op.state = LogonState::CustomCommands;
                Step::Continue
            }
            LogonState::CustomCommands => Step::Continue,
            LogonState::AuthWait | LogonState::Done => Step::Finish(ReplyCode::internal()),
        }
    }

    fn logon_after_welcome(&mut self, op: &mut LogonOp, server: &Server) -> Step<FtpOp> {
        let wants_tls = matches!(server.protocol, Protocol::Ftp | Protocol::Ftpes);
        if wants_tls && !self.tls_active && self.proxy.is_none() {
            op.state = LogonState::AuthTls;
        } else {
            self.enter_login(op, server);
        }
        Step::Continue
    }

    fn enter_login(&mut self, op: &mut LogonOp, server: &Server) {
        let password = op
            .prompted_password
            .clone()
            .unwrap_or_else(|| server.password.clone());
        op.sequence = build_login_sequence(server, &password, self.proxy.as_ref());
        op.custom_commands = server.post_login_commands.iter().cloned().collect();
        op.state = LogonState::Logon;
    }

    fn logon_login_reply(&mut self, op: &mut LogonOp, server: &Server) -> Step<FtpOp> {
        let Some(command) = op.sequence.pop_front() else {
            return Step::Finish(ReplyCode::internal());
        };
        let code = self.reply_code();
        match code / 100 {
            2 => {
                while op.sequence.front().is_some_and(|c| c.optional) {
                    op.sequence.pop_front();
                }
                if op.sequence.is_empty() {
                    op.state = LogonState::Syst;
                }
                Step::Continue
            }
            3 => {
                if op.sequence.is_empty() {
                    error!("Server wants more login data than configured");
                    return Step::Finish(ReplyCode::critical());
                }
                Step::Continue
            }
            class => {
                let password = op
                    .prompted_password
                    .clone()
                    .unwrap_or_else(|| server.password.clone());
                let non_ascii = !server.user.is_ascii() || !password.is_ascii();
                if class == 5
                    && server.charset == Charset::Auto
                    && self.use_utf8
                    && !op.tried_local_charset
                    && non_ascii
                {
                    info!("Login failed, retrying with the local charset");
                    op.tried_local_charset = true;
                    self.use_utf8 = false;
                    op.sequence = build_login_sequence(server, &password, self.proxy.as_ref());
                    return Step::Continue;
                }
                error!("Login failed: {}", self.last_reply);
                let mut result = ReplyCode::critical();
                if class == 5 && (code == 530 || command.kind == LoginKind::Pass) {
                    result = result.with_password_failed();
                }
                Step::Finish(result)
            }
        }
    }

    pub(super) fn logon_trust_reply(&mut self, op: &mut LogonOp, trusted: bool) -> Step<FtpOp> {
        op.tls_trust_pending = false;
        if !trusted {
            error!("Certificate rejected");
            return Step::Finish(ReplyCode::critical());
        }
        self.tls_active = true;
        info!("TLS connection established");
        let Some(server) = self.core.server.clone() else {
            return Step::Finish(ReplyCode::internal());
        };
        match op.state {
            LogonState::AuthWait => {
                self.enter_login(op, &server);
                Step::Continue
            }
            LogonState::Welcome if op.welcome_seen => self.logon_after_welcome(op, &server),
            _ => Step::Wait,
        }
    }

    pub(super) fn logon_password_reply(
        &mut self,
        op: &mut LogonOp,
        password: Option<String>,
    ) -> Step<FtpOp> {
        let Some(password) = password else {
            info!("Login canceled");
            return Step::Finish(ReplyCode::canceled());
        };
        if let Some(command) = op
            .sequence
            .iter_mut()
            .find(|c| c.kind == LoginKind::Pass)
        {
            command.text = format!("PASS {}", password);
        }
        op.prompted_password = Some(password);
        Step::Continue
    }

    fn apply_syst(&mut self, text: &str) {
        let Some(detected) = server_type_from_syst(text) else {
            return;
        };
        if let Some(server) = self.core.server.as_mut() {
            if server.server_type == ServerType::Default {
                debug!("Server type {:?} detected from SYST", detected);
                server.server_type = detected;
            }
        }
    }

    fn parse_feat(&mut self, server: &Server) {
        let mut caps = self.core.ctx.capabilities();
        for line in self.reply_lines.iter().skip(1) {
            if line.len() >= 3 && line.as_bytes()[..3].iter().all(u8::is_ascii_digit) {
                continue;
            }
            let feature = line.trim();
            let upper = feature.to_ascii_uppercase();
            let yes = CapabilityValue::Yes;
            match upper.as_str() {
                "UTF8" => caps.set(server, Capability::Utf8Command, yes),
                "CLNT" => caps.set(server, Capability::ClntCommand, yes),
                "MLSD" => caps.set(server, Capability::MlsdCommand, yes),
                "MFMT" => caps.set(server, Capability::MfmtCommand, yes),
                "MDTM" => caps.set(server, Capability::MdtmCommand, yes),
                "SIZE" => caps.set(server, Capability::SizeCommand, yes),
                "MODE Z" => caps.set(server, Capability::ModeZSupport, yes),
                "TVFS" => caps.set(server, Capability::TvfsSupport, yes),
                "REST STREAM" => caps.set(server, Capability::RestStream, yes),
                "EPSV" => caps.set(server, Capability::EpsvCommand, yes),
                "PRET" => caps.set(server, Capability::PretCommand, yes),
                _ if upper.starts_with("MLST") => {
                    caps.set(server, Capability::MlsdCommand, yes);
                    let facts = feature.get(4..).unwrap_or("").trim();
                    caps.set_text(server, Capability::OptsMlstCommand, yes, facts);
                }
                _ if upper.starts_with("AUTH ") => {
                    if upper.contains("TLS") {
                        caps.set(server, Capability::AuthTlsCommand, yes);
                    }
                    if upper.contains("SSL") {
                        caps.set(server, Capability::AuthSslCommand, yes);
                    }
                }
                _ => {}
            }
        }
        caps.set(server, Capability::FeatCommand, CapabilityValue::Yes);
        caps.conclude_unknown(server, FEAT_CAPABILITIES);
        caps.conclude_unknown(server, &[Capability::OptsMlstCommand]);
    }

    /// `OPTS MLST` selecting the facts we parse, or `None` if the server
    /// already enables all of them.
    fn opts_mlst_command(&self, server: &Server) -> Option<String> {
        let (value, facts) = self
            .core
            .ctx
            .capabilities()
            .get_text(server, Capability::OptsMlstCommand);
        let facts = facts.filter(|_| value == CapabilityValue::Yes)?;
        let mut selected = Vec::new();
        let mut all_enabled = true;
        for fact in facts.split(';').filter(|f| !f.is_empty()) {
            let enabled = fact.ends_with('*');
            let name = fact.trim_end_matches('*');
            if WANTED_MLST_FACTS.iter().any(|w| w.eq_ignore_ascii_case(name)) {
                selected.push(name.to_string());
                all_enabled &= enabled;
            }
        }
        if selected.is_empty() || all_enabled {
            return None;
        }
        Some(format!("OPTS MLST {};", selected.join(";")))
    }
}
