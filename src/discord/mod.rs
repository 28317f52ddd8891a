//! # Discord Gateway Integration
//!
//! Bridges the serenity gateway client to the pipeline. Inbound `message` and
//! `message_update` events are converted into [`InboundMessage`]s and handed to
//! the [`EmbedEnhancer`]; [`DiscordChat`] implements [`ChatPlatform`] on top of
//! serenity's REST client so the pipeline never touches serenity types.
//!
//! ## Outbound Mapping
//!
//! - **Preview cards** become embeds (Discord caps a message at 10)
//! - **Files** become attachments; `attachment://<name>` image URLs resolve
//!   against them
//! - **Replies** reference the triggering message without pinging its author
//! - **Preview suppression** edits the user's message with `SUPPRESS_EMBEDS`
//!
//! ## Required Intents
//!
//! `GUILD_MESSAGES` and the privileged `MESSAGE_CONTENT` intent; without the
//! latter every message arrives with empty content and nothing is enhanced.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::all::{
    ChannelId, Context, CreateAllowedMentions, CreateAttachment, CreateEmbed, CreateEmbedAuthor,
    CreateEmbedFooter, CreateMessage, EditMessage, EventHandler, GatewayIntents, Http,
    Message as SerenityMessage, MessageId, MessageUpdateEvent, ReactionType, Ready,
};
use serenity::Client;
use tracing::{debug, info, warn};

use crate::chat::{Attachment, ChatAuthor, ChatPlatform, InboundMessage, MessageRef};
use crate::embed_enhancer::EmbedEnhancer;
use crate::models::{OutboundMessage, PreviewCard};

/// Discord allows at most this many embeds per message
const MAX_EMBEDS: usize = 10;

fn parse_id(raw: &str) -> Result<u64> {
    raw.parse()
        .with_context(|| format!("invalid Discord snowflake: {raw}"))
}

fn channel(raw: &str) -> Result<ChannelId> {
    Ok(ChannelId::new(parse_id(raw)?))
}

fn message_id(raw: &str) -> Result<MessageId> {
    Ok(MessageId::new(parse_id(raw)?))
}

fn embed(card: &PreviewCard) -> CreateEmbed {
    let mut embed = CreateEmbed::new();
    if let Some(title) = &card.title {
        embed = embed.title(title);
    }
    if let Some(description) = &card.description {
        embed = embed.description(description);
    }
    if let Some(url) = &card.url {
        embed = embed.url(url);
    }
    if let Some(color) = card.color {
        embed = embed.colour(color);
    }
    if let Some(timestamp) = card.timestamp {
        embed = embed.timestamp(timestamp);
    }
    if let Some(author) = &card.author {
        let mut block = CreateEmbedAuthor::new(&author.name);
        if let Some(url) = &author.url {
            block = block.url(url);
        }
        if let Some(icon) = &author.icon_url {
            block = block.icon_url(icon);
        }
        embed = embed.author(block);
    }
    if let Some(image) = &card.image_url {
        embed = embed.image(image);
    }
    if let Some(footer) = &card.footer {
        embed = embed.footer(CreateEmbedFooter::new(footer));
    }
    embed
}

/// Build the serenity payload for an outbound message
fn create_message(message: OutboundMessage) -> CreateMessage {
    let mut builder = CreateMessage::new();
    if let Some(content) = message.content.filter(|content| !content.is_empty()) {
        builder = builder.content(content);
    }
    let embeds: Vec<CreateEmbed> = message.cards.iter().take(MAX_EMBEDS).map(embed).collect();
    if !embeds.is_empty() {
        builder = builder.embeds(embeds);
    }
    let files: Vec<CreateAttachment> = message
        .files
        .into_iter()
        .map(|file| CreateAttachment::bytes(file.data, file.filename))
        .collect();
    if !files.is_empty() {
        builder = builder.add_files(files);
    }
    builder
}

/// [`ChatPlatform`] over Discord's REST API.
///
/// Holds only the shared `Http` client, so it can be built before the gateway
/// connects and cloned freely.
#[derive(Clone)]
pub struct DiscordChat {
    http: Arc<Http>,
}

impl DiscordChat {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ChatPlatform for DiscordChat {
    async fn reply(&self, to: &InboundMessage, message: OutboundMessage) -> Result<MessageRef> {
        let channel_id = channel(&to.channel_id)?;
        let builder = create_message(message)
            .reference_message((channel_id, message_id(&to.id)?))
            .allowed_mentions(CreateAllowedMentions::new().replied_user(false));
        let sent = channel_id
            .send_message(&self.http, builder)
            .await
            .context("failed to send reply")?;
        Ok(MessageRef {
            channel_id: sent.channel_id.to_string(),
            message_id: sent.id.to_string(),
        })
    }

    async fn send(&self, channel_id: &str, message: OutboundMessage) -> Result<MessageRef> {
        let sent = channel(channel_id)?
            .send_message(&self.http, create_message(message))
            .await
            .context("failed to send message")?;
        Ok(MessageRef {
            channel_id: sent.channel_id.to_string(),
            message_id: sent.id.to_string(),
        })
    }

    async fn react(&self, target: &MessageRef, emoji: &str) -> Result<()> {
        channel(&target.channel_id)?
            .create_reaction(
                &self.http,
                message_id(&target.message_id)?,
                ReactionType::Unicode(emoji.to_string()),
            )
            .await
            .context("failed to add reaction")
    }

    async fn delete_message(&self, target: &MessageRef) -> Result<()> {
        channel(&target.channel_id)?
            .delete_message(&self.http, message_id(&target.message_id)?)
            .await
            .context("failed to delete message")
    }

    async fn suppress_previews(&self, target: &MessageRef) -> Result<()> {
        channel(&target.channel_id)?
            .edit_message(
                &self.http,
                message_id(&target.message_id)?,
                EditMessage::new().suppress_embeds(true),
            )
            .await
            .context("failed to suppress embeds")?;
        Ok(())
    }

    async fn edit_message(&self, target: &MessageRef, content: &str) -> Result<()> {
        channel(&target.channel_id)?
            .edit_message(
                &self.http,
                message_id(&target.message_id)?,
                EditMessage::new().content(content),
            )
            .await
            .context("failed to edit message")?;
        Ok(())
    }

    fn message_link(&self, guild_id: &str, target: &MessageRef) -> String {
        format!(
            "https://discord.com/channels/{guild_id}/{}/{}",
            target.channel_id, target.message_id
        )
    }

    fn mention(&self, user_id: &str) -> String {
        format!("<@{user_id}>")
    }
}

/// Gateway event handler feeding the pipeline.
///
/// serenity dispatches every event on its own task, so slow enhancements never
/// hold up the gateway.
pub struct Handler {
    enhancer: Arc<EmbedEnhancer>,
}

impl Handler {
    pub fn new(enhancer: Arc<EmbedEnhancer>) -> Self {
        Self { enhancer }
    }

    async fn inbound(ctx: &Context, msg: &SerenityMessage) -> InboundMessage {
        let channel_name = match msg.channel_id.name(ctx).await {
            Ok(name) => Some(name),
            Err(e) => {
                debug!(channel = %msg.channel_id, error = %e, "could not resolve channel name");
                None
            }
        };

        InboundMessage {
            id: msg.id.to_string(),
            content: msg.content.clone(),
            attachments: msg
                .attachments
                .iter()
                .map(|attachment| Attachment {
                    url: attachment.url.clone(),
                    filename: attachment.filename.clone(),
                    content_type: attachment.content_type.clone(),
                    size: u64::from(attachment.size),
                })
                .collect(),
            author: ChatAuthor {
                id: msg.author.id.to_string(),
                name: msg
                    .author
                    .global_name
                    .clone()
                    .unwrap_or_else(|| msg.author.name.clone()),
                username: msg.author.name.clone(),
                avatar_url: msg.author.avatar_url(),
                is_bot: msg.author.bot,
            },
            guild_id: msg.guild_id.map(|id| id.to_string()),
            channel_id: msg.channel_id.to_string(),
            channel_name,
            created_at: DateTime::from_timestamp(msg.timestamp.unix_timestamp(), 0)
                .unwrap_or_else(Utc::now),
        }
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!(user = %ready.user.name, guilds = ready.guilds.len(), "connected to Discord");
    }

    async fn message(&self, ctx: Context, msg: SerenityMessage) {
        if msg.author.bot {
            return;
        }
        let inbound = Self::inbound(&ctx, &msg).await;
        let outcome = self.enhancer.process_message(&inbound).await;
        debug!(message = %inbound.id, ?outcome, "processed message");
    }

    async fn message_update(
        &self,
        ctx: Context,
        old_if_available: Option<SerenityMessage>,
        new: Option<SerenityMessage>,
        event: MessageUpdateEvent,
    ) {
        // embed-only updates carry no content change
        if event.content.is_none() {
            return;
        }

        let updated = match new {
            Some(msg) => msg,
            None => match event.channel_id.message(&ctx.http, event.id).await {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(message = %event.id, error = %e, "failed to fetch edited message");
                    return;
                }
            },
        };
        if updated.author.bot {
            return;
        }

        let inbound = Self::inbound(&ctx, &updated).await;
        let previous = old_if_available.map(|msg| msg.content);
        let outcome = self
            .enhancer
            .process_message_edit(previous.as_deref(), &inbound)
            .await;
        debug!(message = %inbound.id, ?outcome, "processed edit");
    }
}

const CACHED_MESSAGES_PER_CHANNEL: usize = 100;

/// Gateway client for the bot token, with the intents the pipeline needs
pub async fn build_client(token: &str, enhancer: Arc<EmbedEnhancer>) -> Result<Client> {
    let intents = GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::GUILDS
        | GatewayIntents::MESSAGE_CONTENT;

    // keeps the pre-edit content of recent messages for `message_update`
    let mut cache_settings = serenity::cache::Settings::default();
    cache_settings.max_messages = CACHED_MESSAGES_PER_CHANNEL;

    Client::builder(token, intents)
        .cache_settings(cache_settings)
        .event_handler(Handler::new(enhancer))
        .await
        .context("failed to create Discord client")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CardAuthor, OutboundFile};

    #[test]
    fn parses_snowflakes() {
        assert_eq!(parse_id("123456789012345678").expect("snowflake"), 123_456_789_012_345_678);
        assert!(parse_id("not-a-number").is_err());
        assert!(channel("0x10").is_err());
    }

    #[test]
    fn links_and_mentions_use_discord_format() {
        let chat = DiscordChat::new(Arc::new(Http::new("token")));
        let target = MessageRef {
            channel_id: "2".to_string(),
            message_id: "3".to_string(),
        };
        assert_eq!(chat.message_link("1", &target), "https://discord.com/channels/1/2/3");
        assert_eq!(chat.mention("42"), "<@42>");
    }

    #[test]
    fn builds_payload_within_embed_cap() {
        let card = PreviewCard {
            description: Some("text".to_string()),
            author: Some(CardAuthor {
                name: "artist".to_string(),
                url: None,
                icon_url: None,
            }),
            image_url: Some("attachment://0_a.png".to_string()),
            ..PreviewCard::default()
        };
        let message = OutboundMessage {
            content: Some("https://fxtwitter.com/a/status/1".to_string()),
            cards: vec![card; 12],
            files: vec![OutboundFile {
                filename: "0_a.png".to_string(),
                data: vec![1, 2, 3],
            }],
        };

        // serenity builders are opaque; the payload serializes to the REST body
        let body = serde_json::to_value(create_message(message)).expect("serializable payload");
        assert_eq!(body["embeds"].as_array().map(Vec::len), Some(MAX_EMBEDS));
        assert_eq!(body["content"], "https://fxtwitter.com/a/status/1");
    }
}
