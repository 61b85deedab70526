use channel_message::{Channel, ReplyTarget};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::info;

use crate::channel::Reply;
use crate::context::SharedContext;
use crate::meow::{self, PHOTO_CAPTION, Style};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
pub enum MeowCommand {
    #[strum(serialize = "meowsay")]
    Say,
    #[strum(serialize = "meowthink")]
    Think,
    #[strum(serialize = "meowprompt")]
    Prompt,
    #[strum(serialize = "meowpetrol")]
    Petrol,
    #[strum(serialize = "meowfact")]
    Fact,
    #[strum(serialize = "meowisblocked")]
    IsBlocked,
    /// Any message mentioning "meow".
    #[strum(serialize = "meow")]
    Meow,
}

impl MeowCommand {
    /// Prefixed commands in the order they are tried.
    pub const PREFIXED: [MeowCommand; 6] = [
        MeowCommand::Say,
        MeowCommand::Think,
        MeowCommand::Prompt,
        MeowCommand::Petrol,
        MeowCommand::Fact,
        MeowCommand::IsBlocked,
    ];
}

/// Maps message text to a command. The first matching prefixed command
/// wins; the "meow" substring rule is only tried when none matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTable {
    prefixes: &'static [&'static str],
    photo_on_meow: bool,
}

impl CommandTable {
    pub fn for_channel(channel: Channel) -> Self {
        match channel {
            Channel::Telegram => Self {
                prefixes: &["/", "!"],
                photo_on_meow: true,
            },
            Channel::Discord => Self {
                prefixes: &["!"],
                photo_on_meow: true,
            },
            Channel::Slack => Self {
                prefixes: &["!"],
                photo_on_meow: false,
            },
        }
    }

    /// Returns the command and its trimmed argument text.
    pub fn match_text(&self, text: &str) -> Option<(MeowCommand, String)> {
        for command in MeowCommand::PREFIXED {
            for prefix in self.prefixes {
                let Some(rest) = text
                    .strip_prefix(prefix)
                    .and_then(|t| t.strip_prefix(command.as_ref()))
                else {
                    continue;
                };
                return Some((command, strip_bot_mention(rest).trim().to_string()));
            }
        }

        if self.photo_on_meow && text.to_lowercase().contains("meow") {
            return Some((MeowCommand::Meow, String::new()));
        }
        None
    }
}

/// Drops the `@botname` Telegram appends to commands in group chats.
fn strip_bot_mention(rest: &str) -> &str {
    match rest.strip_prefix('@') {
        Some(mention) => mention
            .find(char::is_whitespace)
            .map(|i| &mention[i..])
            .unwrap_or(""),
        None => rest,
    }
}

/// Produces the reply for one command. `None` means nothing is sent back
/// right away (prompts are answered later through `POST /chat`).
pub async fn respond(
    ctx: &SharedContext,
    channel: Channel,
    command: MeowCommand,
    args: &str,
    target: &ReplyTarget,
) -> Option<Reply> {
    info!(%channel, %command, chat = %target.chat, "handling command");
    match command {
        MeowCommand::Say => Some(Reply::Text(meow::meow_say(args, Style::Say, true))),
        MeowCommand::Think => Some(Reply::Text(meow::meow_say(args, Style::Think, true))),
        MeowCommand::Prompt => {
            meow::meow_prompt(ctx, args, channel, &target.to_destination()).await;
            None
        }
        MeowCommand::Petrol => Some(Reply::Text(meow::meow_petrol(ctx).await)),
        MeowCommand::Fact => Some(Reply::Text(meow::meow_fact(ctx).await)),
        MeowCommand::IsBlocked => Some(Reply::Text(meow::meow_blockedornot(ctx, args).await)),
        MeowCommand::Meow => Some(match meow::meow_photo(ctx).await {
            Ok(bytes) => Reply::Photo {
                bytes,
                caption: PHOTO_CAPTION.to_string(),
            },
            Err(_) => Reply::Text(meow::meow_say(meow::NO_PHOTO, Style::Say, false)),
        }),
    }
}
