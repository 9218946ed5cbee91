//! Bot façade: owns the scheduler, conversations and the update loop.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tgb_core::{
    config::Config,
    domain::{ChatRef, MessageRef, UserId},
    errors::Error,
    messaging::{
        payload::{Media, Payload},
        port::{decode, Body, Transport},
        types::{
            BotCommand, BotCommandScope, Chat, ChatMember, Message, ReplyMarkup, SendOptions,
            Update, UpdateKind, User,
        },
    },
    richtext::{MediaRef, ResolvedMedia},
    scheduler::Scheduler,
    Result,
};

use crate::{
    commands::{parse_update, Command, Denial, Dispatcher, Registry},
    conversation::Conversations,
    poller::{Poller, UpdateSink},
    transport::HttpTransport,
};

pub const TIMEOUT_REPLY: &str = "No answer received in time, please start over.";

#[derive(Clone)]
pub struct Bot {
    inner: Arc<BotInner>,
}

struct BotInner {
    cfg: Config,
    transport: Arc<dyn Transport>,
    scheduler: Scheduler,
    conversations: Conversations,
    me: User,
    username: String,
}

impl Bot {
    /// Connect over HTTPS and identify the bot with `getMe`.
    pub async fn connect(cfg: Config) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&cfg)?);
        Self::with_transport(cfg, transport).await
    }

    pub async fn with_transport(cfg: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let me: User = decode(
            "getMe",
            transport
                .invoke("getMe", &Body::empty())
                .await
                .map_err(|e| e.context("getMe"))?,
        )?;
        let username = me
            .username
            .clone()
            .ok_or_else(|| Error::Config("bot account has no username".to_string()))?;
        info!(username = %username, id = %me.id, "Bot identified");

        let scheduler = Scheduler::new(transport.clone(), cfg.clone());
        Ok(Self {
            inner: Arc::new(BotInner {
                cfg,
                transport,
                scheduler,
                conversations: Conversations::new(),
                me,
                username,
            }),
        })
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    pub fn me(&self) -> &User {
        &self.inner.me
    }

    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }

    pub async fn send(
        &self,
        chat: &ChatRef,
        payload: &Payload,
        opts: &SendOptions,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        self.inner.scheduler.send(chat, payload, opts, cancel).await
    }

    pub async fn send_media_group(
        &self,
        chat: &ChatRef,
        media: Vec<Media>,
        opts: &SendOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        self.inner
            .scheduler
            .send_group(chat, media, opts, cancel)
            .await
    }

    /// Start resolving media in the background, bounded by the configured media timeout.
    pub fn media<F>(&self, resolve: F) -> MediaRef
    where
        F: Future<Output = Result<ResolvedMedia>> + Send + 'static,
    {
        MediaRef::spawn(resolve, self.inner.cfg.media_timeout)
    }

    /// Send `prompt` with a selective force-reply and wait for the answer.
    pub async fn ask(
        &self,
        chat: &ChatRef,
        prompt: &Payload,
        opts: &SendOptions,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        let opts = SendOptions {
            reply_markup: Some(ReplyMarkup::force_reply_selective()),
            ..opts.clone()
        };
        let sent = self.send(chat, prompt, &opts, cancel).await?;
        let waiter = self.inner.conversations.register(sent.msg_ref());
        waiter.wait(self.inner.cfg.answer_timeout, cancel).await
    }

    /// Ask inside a command's chat, replying to the command. On timeout the user
    /// is told so and `Error::Timeout` is returned.
    pub async fn ask_in(
        &self,
        cmd: &Command,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        let chat = ChatRef::Id(cmd.chat.id);
        let opts = reply_options(cmd);
        match self.ask(&chat, &Payload::text(question), &opts, cancel).await {
            Err(e) if matches!(e.root(), Error::Timeout) => {
                if let Err(e) = self
                    .send(&chat, &Payload::text(TIMEOUT_REPLY), &opts, cancel)
                    .await
                {
                    warn!("Failed to send timeout notice: {e}");
                }
                Err(e)
            }
            other => other,
        }
    }

    /// Complete a pending `ask` with `msg`. Returns `false` if nobody was waiting.
    pub(crate) fn answer(&self, msg: &Message) -> bool {
        self.inner.conversations.answer(msg)
    }

    /// Reply to a command: an alert (or URL) for button presses, a message otherwise.
    pub async fn reply(&self, cmd: &Command, text: &str, cancel: &CancellationToken) -> Result<()> {
        if let Some(id) = &cmd.callback_query_id {
            let is_url = text.starts_with("https://") || text.starts_with("http://");
            return if is_url {
                self.answer_callback_query(id, None, false, Some(text), cancel)
                    .await
            } else {
                self.answer_callback_query(id, Some(text), true, None, cancel)
                    .await
            };
        }

        self.send(
            &ChatRef::Id(cmd.chat.id),
            &Payload::text(text),
            &reply_options(cmd),
            cancel,
        )
        .await
        .map(|_| ())
    }

    pub async fn get_chat(&self, chat: &ChatRef, cancel: &CancellationToken) -> Result<Chat> {
        self.call("getChat", json!({ "chat_id": chat }), cancel).await
    }

    pub async fn get_chat_member(
        &self,
        chat: &ChatRef,
        user: UserId,
        cancel: &CancellationToken,
    ) -> Result<ChatMember> {
        self.call(
            "getChatMember",
            json!({ "chat_id": chat, "user_id": user }),
            cancel,
        )
        .await
    }

    pub async fn get_chat_administrators(
        &self,
        chat: &ChatRef,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChatMember>> {
        self.call("getChatAdministrators", json!({ "chat_id": chat }), cancel)
            .await
    }

    pub async fn answer_callback_query(
        &self,
        id: &str,
        text: Option<&str>,
        show_alert: bool,
        url: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut body = json!({ "callback_query_id": id });
        if let Some(text) = text {
            body["text"] = json!(text);
            body["show_alert"] = json!(show_alert);
        }
        if let Some(url) = url {
            body["url"] = json!(url);
        }
        self.call::<bool>("answerCallbackQuery", body, cancel)
            .await
            .map(|_| ())
    }

    pub async fn delete_message(&self, msg: MessageRef, cancel: &CancellationToken) -> Result<()> {
        self.call::<bool>(
            "deleteMessage",
            json!({ "chat_id": msg.chat_id, "message_id": msg.message_id }),
            cancel,
        )
        .await
        .map(|_| ())
    }

    pub async fn export_chat_invite_link(
        &self,
        chat: &ChatRef,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.call("exportChatInviteLink", json!({ "chat_id": chat }), cancel)
            .await
    }

    pub async fn set_my_commands(
        &self,
        scope: BotCommandScope,
        commands: &[BotCommand],
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.call::<bool>(
            "setMyCommands",
            json!({ "commands": commands, "scope": scope }),
            cancel,
        )
        .await
        .map(|_| ())
    }

    pub async fn delete_my_commands(
        &self,
        scope: BotCommandScope,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.call::<bool>("deleteMyCommands", json!({ "scope": scope }), cancel)
            .await
            .map(|_| ())
    }

    /// Publish the command menu, then dispatch updates until `cancel` fires.
    pub async fn listen(&self, listener: Listener, cancel: CancellationToken) -> Result<()> {
        let Listener {
            dispatcher,
            allowed_updates,
            publish_commands,
        } = listener;

        if publish_commands {
            for (scope, commands) in dispatcher.registry().manifest() {
                if let Err(e) = self.set_my_commands(scope, &commands, &cancel).await {
                    warn!(?scope, "Failed to publish commands: {e}");
                }
            }
        }

        let sink = Arc::new(DispatchSink {
            bot: self.clone(),
            dispatcher,
            cancel: cancel.clone(),
        });
        Poller::new(self.inner.transport.clone(), self.inner.cfg.long_poll_timeout_secs)
            .allowed_updates(allowed_updates)
            .run(sink, cancel)
            .await;
        Ok(())
    }

    /// Cancel pending sends and wait for them to settle.
    pub async fn shutdown(&self) {
        self.inner.scheduler.shutdown().await;
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let value = self
            .inner
            .scheduler
            .call_global(method, Body::Json(params), cancel)
            .await?;
        decode(method, value)
    }
}

fn reply_options(cmd: &Command) -> SendOptions {
    match &cmd.message {
        Some(msg) if !cmd.is_callback() => SendOptions::reply_to(msg.id),
        _ => SendOptions::default(),
    }
}

/// Everything `listen` needs besides the bot itself.
pub struct Listener {
    dispatcher: Dispatcher,
    allowed_updates: Vec<String>,
    publish_commands: bool,
}

impl Listener {
    pub fn new(registry: Registry) -> Self {
        Self {
            dispatcher: Dispatcher::new(registry),
            allowed_updates: vec![
                Update::MESSAGE.to_string(),
                Update::EDITED_MESSAGE.to_string(),
                Update::CALLBACK_QUERY.to_string(),
            ],
            publish_commands: true,
        }
    }

    pub fn denial(mut self, denial: Denial) -> Self {
        self.dispatcher = self.dispatcher.denial(denial);
        self
    }

    pub fn reply_errors(mut self, enabled: bool) -> Self {
        self.dispatcher = self.dispatcher.reply_errors(enabled);
        self
    }

    pub fn allowed_updates(mut self, kinds: Vec<String>) -> Self {
        self.allowed_updates = kinds;
        self
    }

    pub fn publish_commands(mut self, enabled: bool) -> Self {
        self.publish_commands = enabled;
        self
    }
}

struct DispatchSink {
    bot: Bot,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
}

#[async_trait]
impl UpdateSink for DispatchSink {
    async fn handle(&self, update: Update) {
        // Answers to pending questions never reach command handlers.
        if let UpdateKind::Message(msg) = &update.kind {
            if self.bot.answer(msg) {
                return;
            }
        }

        let Some(cmd) = parse_update(&update, self.bot.username()) else {
            return;
        };
        if let Err(e) = self
            .dispatcher
            .dispatch(&self.bot, cmd, self.cancel.child_token())
            .await
        {
            warn!(update_id = update.id, "Update not handled: {e}");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::VecDeque,
        sync::Mutex,
        time::Duration,
    };

    use tgb_core::domain::ChatId;

    use super::*;
    use crate::commands::{handler_fn, Registration, Scope};

    /// Records calls, answers sends with a message in the requested private chat.
    pub(crate) struct FakeApi {
        pub calls: Mutex<Vec<(String, Value)>>,
        pub updates: Mutex<VecDeque<Value>>,
        pub failing: Mutex<Vec<&'static str>>,
    }

    impl FakeApi {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                updates: Mutex::new(VecDeque::new()),
                failing: Mutex::new(Vec::new()),
            })
        }

        pub fn calls_to(&self, method: &str) -> Vec<Value> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| m == method)
                .map(|(_, b)| b.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for FakeApi {
        async fn invoke(&self, method: &str, body: &Body) -> Result<Value> {
            let params = match body {
                Body::Json(v) => v.clone(),
                Body::Multipart { .. } => Value::Null,
            };
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((method.to_string(), params.clone()));
                calls.len() as i64
            };
            if self.failing.lock().unwrap().iter().any(|m| *m == method) {
                return Err(Error::Api {
                    code: 400,
                    description: "Bad Request: query is too old".into(),
                });
            }
            match method {
                "getMe" => Ok(json!({"id": 1, "is_bot": true, "first_name": "B", "username": "botA"})),
                "getUpdates" => {
                    let next = self.updates.lock().unwrap().pop_front();
                    match next {
                        Some(batch) => Ok(batch),
                        None => {
                            tokio::time::sleep(Duration::from_secs(3600)).await;
                            Ok(json!([]))
                        }
                    }
                }
                m if m.starts_with("send") => Ok(json!({
                    "message_id": 100 + n,
                    "date": 0,
                    "chat": {"id": params["chat_id"].as_i64().unwrap_or(-1001), "type": "private"},
                    "text": params["text"],
                })),
                "getChat" => Ok(json!({"id": params["chat_id"], "type": "private"})),
                _ => Ok(json!(true)),
            }
        }
    }

    fn fast_config() -> Config {
        let mut cfg = Config::new("t");
        cfg.pacing.global_min_interval = Duration::ZERO;
        cfg.pacing.private_min_interval = Duration::ZERO;
        cfg
    }

    pub(crate) async fn bot(api: Arc<FakeApi>) -> Bot {
        Bot::with_transport(fast_config(), api).await.unwrap()
    }

    fn text_update(id: i64, text: &str, reply_to: Option<i64>) -> Value {
        let mut msg = json!({
            "message_id": 10 + id,
            "date": 0,
            "chat": {"id": 42, "type": "private"},
            "from": {"id": 42, "is_bot": false, "first_name": "U"},
            "text": text,
        });
        if text.starts_with('/') {
            let len = text.split(' ').next().unwrap().encode_utf16().count();
            msg["entities"] = json!([{"type": "bot_command", "offset": 0, "length": len}]);
        }
        if let Some(r) = reply_to {
            msg["reply_to_message"] = json!({"message_id": r, "date": 0, "chat": {"id": 42, "type": "private"}});
        }
        json!({"update_id": id, "message": msg})
    }

    #[tokio::test(start_paused = true)]
    async fn identifies_itself() {
        let bot = bot(FakeApi::new()).await;
        assert_eq!(bot.username(), "botA");
    }

    #[tokio::test(start_paused = true)]
    async fn reply_answers_callbacks_and_messages() {
        let api = FakeApi::new();
        let bot = bot(api.clone()).await;
        let cancel = CancellationToken::new();
        let chat: Chat = serde_json::from_value(json!({"id": 42, "type": "private"})).unwrap();
        let msg: Message = serde_json::from_value(
            json!({"message_id": 5, "date": 0, "chat": {"id": 42, "type": "private"}}),
        )
        .unwrap();

        let mut cmd = Command {
            chat,
            user: None,
            message: Some(msg),
            key: "/ping".into(),
            payload: String::new(),
            args: vec![],
            callback_query_id: None,
        };
        bot.reply(&cmd, "pong", &cancel).await.unwrap();
        let sent = api.calls_to("sendMessage");
        assert_eq!(sent[0]["text"], "pong");
        assert_eq!(sent[0]["reply_to_message_id"], 5);

        cmd.callback_query_id = Some("cb".into());
        bot.reply(&cmd, "done", &cancel).await.unwrap();
        bot.reply(&cmd, "https://t.me/x", &cancel).await.unwrap();
        let answers = api.calls_to("answerCallbackQuery");
        assert_eq!(answers[0], json!({"callback_query_id": "cb", "text": "done", "show_alert": true}));
        assert_eq!(answers[1], json!({"callback_query_id": "cb", "url": "https://t.me/x"}));
    }

    #[tokio::test(start_paused = true)]
    async fn ask_correlates_reply_and_leaves_other_messages_to_commands() {
        let api = FakeApi::new();
        let bot = bot(api.clone()).await;
        let cancel = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));

        let mut registry = Registry::new();
        {
            let seen = seen.clone();
            registry.register(Registration::new(
                "/echo",
                handler_fn(move |_bot, cmd, _cancel| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(cmd.payload);
                        Ok(())
                    }
                }),
            ));
        }

        let asking = {
            let bot = bot.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                bot.ask(
                    &ChatRef::Id(ChatId(42)),
                    &Payload::text("name?"),
                    &SendOptions::default(),
                    &cancel,
                )
                .await
            })
        };
        // The prompt is the second call, so its id is 102.
        while bot.inner.conversations.is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let prompt = &api.calls_to("sendMessage")[0];
        assert_eq!(prompt["reply_markup"], json!({"force_reply": true, "selective": true}));

        api.updates
            .lock()
            .unwrap()
            .push_back(json!([text_update(1, "/echo hi", None), text_update(2, "Bob", Some(102))]));

        let listener = Listener::new(registry).publish_commands(false);
        let listening = {
            let bot = bot.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bot.listen(listener, cancel).await })
        };

        let answer = asking.await.unwrap().unwrap();
        assert_eq!(answer.text.as_deref(), Some("Bob"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        listening.await.unwrap().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["hi".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn ask_times_out_and_tells_the_user() {
        let api = FakeApi::new();
        let bot = bot(api.clone()).await;
        let chat: Chat = serde_json::from_value(json!({"id": 42, "type": "private"})).unwrap();
        let cmd = Command {
            chat,
            user: None,
            message: None,
            key: "/ask".into(),
            payload: String::new(),
            args: vec![],
            callback_query_id: None,
        };

        let err = bot
            .ask_in(&cmd, "name?", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::Timeout));

        let sent = api.calls_to("sendMessage");
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1]["text"], TIMEOUT_REPLY);
    }

    #[tokio::test(start_paused = true)]
    async fn scope_denial_replies_forbidden_and_manifest_is_published() {
        let api = FakeApi::new();
        let bot = bot(api.clone()).await;
        let cancel = CancellationToken::new();

        let mut registry = Registry::new();
        registry.register(
            Registration::new("/admin", handler_fn(|_bot, _cmd, _cancel| async { Ok(()) })).scope(
                Scope::Restricted {
                    chat_ids: Default::default(),
                    user_ids: Default::default(),
                },
            ),
        );
        api.updates
            .lock()
            .unwrap()
            .push_back(json!([text_update(1, "/admin", None)]));

        let listener = Listener::new(registry).denial(Denial::Reply);
        let listening = {
            let bot = bot.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bot.listen(listener, cancel).await })
        };
        while api.calls_to("sendMessage").is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        cancel.cancel();
        listening.await.unwrap().unwrap();

        assert_eq!(api.calls_to("sendMessage")[0]["text"], "forbidden");
        // The restricted scope has no chats, so nothing to publish.
        assert!(api.calls_to("setMyCommands").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn handler_errors_become_a_short_reply() {
        let api = FakeApi::new();
        let bot = bot(api.clone()).await;
        let cancel = CancellationToken::new();

        let mut registry = Registry::new();
        registry.register(Registration::new(
            "/boom",
            handler_fn(|_bot, _cmd, _cancel| async { Err(Error::Transport("nope".into())) }),
        ));
        api.updates
            .lock()
            .unwrap()
            .push_back(json!([text_update(1, "/boom", None)]));

        let listening = {
            let bot = bot.clone();
            let cancel = cancel.clone();
            let listener = Listener::new(registry);
            tokio::spawn(async move { bot.listen(listener, cancel).await })
        };
        while api.calls_to("sendMessage").is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        cancel.cancel();
        listening.await.unwrap().unwrap();

        let published = api.calls_to("setMyCommands");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0]["scope"], json!({"type": "default"}));
        assert_eq!(published[0]["commands"][0]["description"], "Boom");
        assert_eq!(
            api.calls_to("sendMessage")[0]["text"],
            crate::commands::ERROR_REPLY
        );
    }

    #[tokio::test(start_paused = true)]
    async fn media_resolution_uses_the_configured_timeout() {
        let mut cfg = fast_config();
        cfg.media_timeout = Duration::from_secs(5);
        let bot = Bot::with_transport(cfg, FakeApi::new()).await.unwrap();

        let started = tokio::time::Instant::now();
        let media = bot.media(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(Error::Transport("never".into()))
        });
        let err = media.get().await.unwrap_err();
        assert!(matches!(err.root(), Error::Timeout));
        assert!(tokio::time::Instant::now() - started < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_callback_is_answered_and_failures_are_tolerated() {
        let api = FakeApi::new();
        api.failing.lock().unwrap().push("answerCallbackQuery");
        let bot = bot(api.clone()).await;
        let dispatcher = Dispatcher::new(Registry::new());

        let update: Update = serde_json::from_value(json!({
            "update_id": 1,
            "callback_query": {
                "id": "cb",
                "from": {"id": 42, "is_bot": false, "first_name": "U"},
                "message": {"message_id": 5, "date": 0, "chat": {"id": 42, "type": "private"}},
                "data": "gone:1",
            },
        }))
        .unwrap();
        let cmd = parse_update(&update, "botA").unwrap();

        dispatcher
            .dispatch(&bot, cmd, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(api.calls_to("answerCallbackQuery").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_rejects_new_sends() {
        let bot = bot(FakeApi::new()).await;
        bot.shutdown().await;
        let err = bot
            .get_chat(&ChatRef::username("x"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
