use crate::error::AppError;
use teloxide::{
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, Recipient, UserId},
};
use tracing::warn;

pub const CHECK_SUBSCRIPTION_CALLBACK: &str = "check_subscription_callback";

/// Gates registration and downloads on membership in the configured channels.
#[derive(Clone)]
pub struct SubscriptionGate {
    channels: Vec<String>,
}

impl SubscriptionGate {
    pub fn new(channels: Vec<String>) -> Self {
        Self { channels }
    }

    /// True when the user is a member (or better) of every required channel.
    /// A failed membership lookup counts as not subscribed.
    pub async fn is_subscribed(&self, bot: &Bot, user_id: UserId) -> bool {
        for channel in &self.channels {
            let member = match bot
                .get_chat_member(Recipient::ChannelUsername(channel.clone()), user_id)
                .await
            {
                Ok(member) => member,
                Err(err) => {
                    warn!(event = "subscription_check_failed", channel = %channel, error = %err);
                    return false;
                }
            };
            let allowed = member.kind.is_owner()
                || member.kind.is_administrator()
                || member.kind.is_member();
            if !allowed {
                return false;
            }
        }
        true
    }

    /// Sends the join-links keyboard plus a "check again" button.
    pub async fn request_subscription(&self, bot: &Bot, chat_id: ChatId) -> Result<(), AppError> {
        let mut rows: Vec<Vec<InlineKeyboardButton>> = Vec::new();
        for channel in &self.channels {
            if let Ok(link) = reqwest::Url::parse(&channel_link(channel)) {
                rows.push(vec![InlineKeyboardButton::url(format!("Join {channel}"), link)]);
            }
        }
        rows.push(vec![InlineKeyboardButton::callback(
            "I subscribed — check again",
            CHECK_SUBSCRIPTION_CALLBACK,
        )]);

        bot.send_message(chat_id, "Subscribe to the required channels to use the bot:")
            .reply_markup(InlineKeyboardMarkup::new(rows))
            .await?;
        Ok(())
    }
}

pub fn channel_link(channel: &str) -> String {
    format!("https://t.me/{}", channel.trim_start_matches('@'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_link_strips_the_at_sign() {
        assert_eq!(channel_link("@news"), "https://t.me/news");
        assert_eq!(channel_link("news"), "https://t.me/news");
    }
}
