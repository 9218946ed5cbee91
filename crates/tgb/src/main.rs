use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tgb_core::{config::Config, domain::ChatRef, formatting::escape_html, richtext::Writer};
use tgb_telegram::{handler_fn, Bot, ChatReceiver, Listener, Registration, Registry, Scope};

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register(
            Registration::new(
                "/start",
                handler_fn(|bot: Bot, cmd, cancel| async move {
                    let text = format!("Hi, I am @{}. Try /ping or /ask.", bot.username());
                    bot.reply(&cmd, &text, &cancel).await
                }),
            )
            .hidden(),
        )
        .register(
            Registration::new(
                "/ping",
                handler_fn(|bot: Bot, cmd, cancel| async move {
                    bot.reply(&cmd, "pong", &cancel).await
                }),
            )
            .description("Check that the bot is alive"),
        )
        .register(
            Registration::new(
                "/ask",
                handler_fn(|bot: Bot, cmd, cancel| async move {
                    let answer = bot.ask_in(&cmd, "What is your name?", &cancel).await?;
                    let name = answer.text.unwrap_or_default();
                    bot.reply(&cmd, &format!("Nice to meet you, {name}."), &cancel)
                        .await
                }),
            )
            .description("Ask a question and wait for the answer")
            .scope(Scope::PrivateChats),
        )
        .register(
            Registration::new(
                "/echo",
                handler_fn(|bot: Bot, cmd, cancel| async move {
                    // Arguments are echoed back as formatted HTML, one per line.
                    let receiver =
                        ChatReceiver::new(bot.clone(), ChatRef::Id(cmd.chat.id), cancel.clone());
                    let mut writer = Writer::new(Arc::new(receiver));
                    for arg in &cmd.args {
                        writer.markup(&format!("<b>{}</b><br>", escape_html(arg)));
                    }
                    writer.flush().await
                }),
            )
            .description("Echo the arguments back"),
        );
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tgb_core::logging::init("tgb")?;

    let cfg = Config::load()?;
    let bot = Bot::connect(cfg).await.context("connect to the Bot API")?;

    let cancel = CancellationToken::new();
    let listening = {
        let bot = bot.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { bot.listen(Listener::new(registry()), cancel).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("wait for ctrl-c")?;
    info!("Shutting down");
    cancel.cancel();

    listening.await.context("join update loop")??;
    bot.shutdown().await;
    Ok(())
}
