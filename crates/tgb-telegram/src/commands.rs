//! Command extraction, handler registry and access scopes.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::Arc,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use tgb_core::{
    args::split_args,
    domain::{ChatId, UserId},
    messaging::types::{BotCommand, BotCommandScope, Chat, ChatType, Message, Update, UpdateKind, User},
    Error, Result,
};

use crate::bot::Bot;

/// A parsed command, from either a message or a callback button.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub chat: Chat,
    pub user: Option<User>,
    /// The command message, or the message carrying the pressed button.
    pub message: Option<Message>,
    /// `/name` for text commands, the data prefix for callbacks.
    pub key: String,
    pub payload: String,
    pub args: Vec<String>,
    pub callback_query_id: Option<String>,
}

impl Command {
    pub fn is_callback(&self) -> bool {
        self.callback_query_id.is_some()
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, bot: &Bot, cmd: Command, cancel: CancellationToken) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Bot, Command, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, bot: &Bot, cmd: Command, cancel: CancellationToken) -> Result<()> {
        (self.0)(bot.clone(), cmd, cancel).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(Bot, Command, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Who may run a command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Scope {
    #[default]
    All,
    PrivateChats,
    Restricted {
        chat_ids: HashSet<ChatId>,
        user_ids: HashSet<UserId>,
    },
}

impl Scope {
    pub fn allows(&self, chat: &Chat, user: Option<&User>) -> bool {
        match self {
            Scope::All => true,
            Scope::PrivateChats => chat.kind == ChatType::Private,
            Scope::Restricted { chat_ids, user_ids } => {
                let direct = user.filter(|u| chat.kind == ChatType::Private && chat.id.0 == u.id.0);
                match direct {
                    Some(u) => user_ids.contains(&u.id),
                    None => chat_ids.contains(&chat.id),
                }
            }
        }
    }

    /// Command-menu scopes this access scope maps onto.
    pub fn menu_scopes(&self) -> Vec<BotCommandScope> {
        match self {
            Scope::All => vec![BotCommandScope::Default],
            Scope::PrivateChats => vec![BotCommandScope::AllPrivateChats],
            Scope::Restricted { chat_ids, user_ids } => {
                let mut ids: Vec<ChatId> = chat_ids
                    .iter()
                    .copied()
                    .chain(user_ids.iter().map(|&u| ChatId::from(u)))
                    .collect();
                ids.sort();
                ids.dedup();
                ids.into_iter()
                    .map(|chat_id| BotCommandScope::Chat { chat_id })
                    .collect()
            }
        }
    }
}

/// A registered command.
pub struct Registration {
    key: String,
    description: Option<String>,
    scope: Scope,
    hidden: bool,
    handler: Arc<dyn CommandHandler>,
}

impl Registration {
    pub fn new(key: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Self {
        Self {
            key: key.into(),
            description: None,
            scope: Scope::All,
            hidden: false,
            handler,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Keep the command out of the command menu.
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }
}

/// What a user outside a command's scope sees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Denial {
    #[default]
    Silent,
    Reply,
}

pub const FORBIDDEN_REPLY: &str = "forbidden";
pub const ERROR_REPLY: &str = "Something went wrong, please try again later.";

#[derive(Default)]
pub struct Registry {
    commands: HashMap<String, Registration>,
    order: Vec<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    /// When `key` is already registered.
    pub fn register(&mut self, reg: Registration) -> &mut Self {
        assert!(
            !self.commands.contains_key(&reg.key),
            "command {} registered twice",
            reg.key
        );
        self.order.push(reg.key.clone());
        self.commands.insert(reg.key.clone(), reg);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.commands.contains_key(key)
    }

    /// Command-menu entries grouped by menu scope, in registration order.
    /// Only visible `/` commands are listed.
    pub fn manifest(&self) -> Vec<(BotCommandScope, Vec<BotCommand>)> {
        let mut out: Vec<(BotCommandScope, Vec<BotCommand>)> = Vec::new();
        for key in &self.order {
            let Some(reg) = self.commands.get(key) else {
                continue;
            };
            let Some(name) = reg.key.strip_prefix('/') else {
                continue;
            };
            if reg.hidden {
                continue;
            }
            let entry = BotCommand {
                command: name.to_string(),
                description: reg
                    .description
                    .clone()
                    .unwrap_or_else(|| default_description(&reg.key)),
            };
            for scope in reg.scope.menu_scopes() {
                match out.iter_mut().find(|(s, _)| *s == scope) {
                    Some((_, list)) => list.push(entry.clone()),
                    None => out.push((scope, vec![entry.clone()])),
                }
            }
        }
        out
    }
}

/// `/list_feeds` -> `List Feeds`.
pub fn default_description(key: &str) -> String {
    key.trim_start_matches('/')
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Routes parsed commands to their handlers.
pub struct Dispatcher {
    registry: Registry,
    denial: Denial,
    reply_errors: bool,
}

impl Dispatcher {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            denial: Denial::Silent,
            reply_errors: true,
        }
    }

    pub fn denial(mut self, denial: Denial) -> Self {
        self.denial = denial;
        self
    }

    pub fn reply_errors(mut self, enabled: bool) -> Self {
        self.reply_errors = enabled;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run the handler for `cmd`. Handler failures are logged and, when enabled,
    /// answered with a short message; only scope denials are returned.
    pub async fn dispatch(&self, bot: &Bot, cmd: Command, cancel: CancellationToken) -> Result<()> {
        let Some(reg) = self.registry.commands.get(&cmd.key) else {
            debug!(key = %cmd.key, "No handler for command");
            if let Some(id) = &cmd.callback_query_id {
                // Stop the client's loading spinner.
                if let Err(e) = bot.answer_callback_query(id, None, false, None, &cancel).await {
                    debug!(key = %cmd.key, "Failed to answer unknown callback: {e}");
                }
            }
            return Ok(());
        };

        if !reg.scope.allows(&cmd.chat, cmd.user.as_ref()) {
            warn!(key = %cmd.key, chat = %cmd.chat.id, "Command outside its scope");
            if self.denial == Denial::Reply {
                if let Err(e) = bot.reply(&cmd, FORBIDDEN_REPLY, &cancel).await {
                    warn!("Failed to send denial: {e}");
                }
            }
            return Err(Error::ForbiddenByScope);
        }

        let key = cmd.key.clone();
        let reply_to = cmd.clone();
        if let Err(e) = reg.handler.handle(bot, cmd, cancel.clone()).await {
            if e.is_cancelled() {
                debug!(key = %key, "Handler cancelled");
                return Ok(());
            }
            error!(key = %key, "Command handler failed: {e}");
            if self.reply_errors {
                if let Err(e) = bot.reply(&reply_to, ERROR_REPLY, &cancel).await {
                    warn!("Failed to report handler error: {e}");
                }
            }
        }
        Ok(())
    }
}

/// Extract a command from an update, if it carries one for this bot.
pub fn parse_update(update: &Update, bot_username: &str) -> Option<Command> {
    match &update.kind {
        UpdateKind::Message(m) | UpdateKind::EditedMessage(m) => parse_message(m, bot_username),
        UpdateKind::CallbackQuery(q) => {
            let message = q.message.clone()?;
            let data = q.data.as_deref()?;
            let (key, payload) = data.split_once(':').unwrap_or((data, ""));
            Some(Command {
                chat: message.chat.clone(),
                user: Some(q.from.clone()),
                message: Some(message),
                key: key.to_string(),
                payload: payload.to_string(),
                args: split_args(payload),
                callback_query_id: Some(q.id.clone()),
            })
        }
        _ => None,
    }
}

/// `/cmd@bot payload`, located through the message's `bot_command` entity.
pub fn parse_message(msg: &Message, bot_username: &str) -> Option<Command> {
    let (text, entities) = msg.text_or_caption()?;
    let entity = entities.iter().find(|e| e.kind == "bot_command")?;
    let (start, end) = utf16_range(text, entity.offset, entity.length)?;

    let raw = &text[start..end];
    let key = match raw.split_once('@') {
        Some((key, suffix)) if suffix.eq_ignore_ascii_case(bot_username) => key,
        // Addressed to another bot in the same group.
        Some(_) => return None,
        None => raw,
    };
    let payload = text[end..].trim();

    Some(Command {
        chat: msg.chat.clone(),
        user: msg.from.clone(),
        message: Some(msg.clone()),
        key: key.to_string(),
        payload: payload.to_string(),
        args: split_args(payload),
        callback_query_id: None,
    })
}

/// Byte range of a UTF-16 `(offset, length)` span, if it falls on char boundaries.
fn utf16_range(text: &str, offset: usize, length: usize) -> Option<(usize, usize)> {
    let end_units = offset.checked_add(length)?;
    let mut units = 0usize;
    let mut start = None;

    for (pos, ch) in text.char_indices() {
        if units == offset {
            start = Some(pos);
        }
        if units == end_units {
            return Some((start?, pos));
        }
        if units > end_units {
            return None;
        }
        units += ch.len_utf16();
    }

    if units == offset {
        start = Some(text.len());
    }
    (units == end_units).then_some((start?, text.len()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn message(text: &str, offset: usize, length: usize, chat: serde_json::Value) -> Message {
        serde_json::from_value(json!({
            "message_id": 3,
            "date": 0,
            "chat": chat,
            "from": {"id": 42, "is_bot": false, "first_name": "A"},
            "text": text,
            "entities": [{"type": "bot_command", "offset": offset, "length": length}],
        }))
        .unwrap()
    }

    fn private() -> serde_json::Value {
        json!({"id": 42, "type": "private"})
    }

    fn group() -> serde_json::Value {
        json!({"id": -7, "type": "group", "title": "g"})
    }

    #[test]
    fn strips_own_suffix() {
        let cmd = parse_message(&message("/ping@botA hi", 0, 10, group()), "bota").unwrap();
        assert_eq!(cmd.key, "/ping");
        assert_eq!(cmd.payload, "hi");
        assert_eq!(cmd.args, vec!["hi"]);
        assert!(!cmd.is_callback());
    }

    #[test]
    fn ignores_commands_for_other_bots() {
        assert!(parse_message(&message("/ping@other hi", 0, 11, group()), "botA").is_none());
    }

    #[test]
    fn entity_offsets_are_utf16() {
        // The emoji is two UTF-16 units and four bytes.
        let text = "😀 /add \"my feed\" x";
        let cmd = parse_message(&message(text, 3, 4, private()), "botA").unwrap();
        assert_eq!(cmd.key, "/add");
        assert_eq!(cmd.args, vec!["my feed", "x"]);

        let cmd = parse_message(&message("/start", 0, 6, private()), "botA").unwrap();
        assert_eq!(cmd.key, "/start");
        assert!(cmd.args.is_empty());

        assert!(parse_message(&message("/x", 0, 9, private()), "botA").is_none());
    }

    #[test]
    fn callback_data_splits_key_and_payload() {
        let update: Update = serde_json::from_value(json!({
            "update_id": 1,
            "callback_query": {
                "id": "cb1",
                "from": {"id": 42, "is_bot": false, "first_name": "A"},
                "message": {"message_id": 9, "date": 0, "chat": private()},
                "data": "unsub:feed+rss+42",
            }
        }))
        .unwrap();

        let cmd = parse_update(&update, "botA").unwrap();
        assert_eq!(cmd.key, "unsub");
        assert_eq!(cmd.payload, "feed+rss+42");
        assert_eq!(cmd.callback_query_id.as_deref(), Some("cb1"));
        assert_eq!(cmd.message.unwrap().id.0, 9);
    }

    #[test]
    fn scope_rules() {
        let chat: Chat = serde_json::from_value(group()).unwrap();
        let dm: Chat = serde_json::from_value(private()).unwrap();
        let user: User = serde_json::from_value(json!({"id": 42, "first_name": "A"})).unwrap();
        let stranger: User = serde_json::from_value(json!({"id": 7, "first_name": "B"})).unwrap();

        assert!(Scope::All.allows(&chat, None));
        assert!(Scope::PrivateChats.allows(&dm, Some(&user)));
        assert!(!Scope::PrivateChats.allows(&chat, Some(&user)));

        let by_chat = Scope::Restricted {
            chat_ids: HashSet::from([ChatId(-7), ChatId(42)]),
            user_ids: HashSet::new(),
        };
        assert!(by_chat.allows(&chat, Some(&stranger)));
        // Listing a user's chat id does not open their direct chat.
        assert!(!by_chat.allows(&dm, Some(&user)));

        let by_user = Scope::Restricted {
            chat_ids: HashSet::new(),
            user_ids: HashSet::from([UserId(42)]),
        };
        assert!(by_user.allows(&dm, Some(&user)));
        assert!(!by_user.allows(&chat, Some(&user)));
    }

    #[test]
    fn manifest_groups_by_scope_with_default_descriptions() {
        let noop = || handler_fn(|_bot, _cmd, _cancel| async { Ok(()) });
        let mut registry = Registry::new();
        registry
            .register(Registration::new("/list_feeds", noop()))
            .register(Registration::new("/start", noop()).description("Say hello"))
            .register(Registration::new("/admin", noop()).scope(Scope::PrivateChats))
            .register(Registration::new("/debug", noop()).hidden())
            .register(Registration::new("unsub", noop()));

        let manifest = registry.manifest();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest[0].0, BotCommandScope::Default);
        assert_eq!(
            manifest[0].1,
            vec![
                BotCommand {
                    command: "list_feeds".into(),
                    description: "List Feeds".into()
                },
                BotCommand {
                    command: "start".into(),
                    description: "Say hello".into()
                },
            ]
        );
        assert_eq!(manifest[1].0, BotCommandScope::AllPrivateChats);
        assert_eq!(manifest[1].1[0].command, "admin");
        assert!(registry.contains("unsub"));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_panics() {
        let noop = || handler_fn(|_bot, _cmd, _cancel| async { Ok(()) });
        let mut registry = Registry::new();
        registry
            .register(Registration::new("/a", noop()))
            .register(Registration::new("/a", noop()));
    }
}
