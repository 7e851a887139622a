use crate::{
    error::AppError,
    formats::{Delivery, FormatSpec},
    publish::Publisher,
};
use std::path::Path;
use teloxide::{prelude::*, types::InputFile};
use tracing::info;

/// Largest file sent inline through the chat transport. 49 MiB keeps a margin
/// under the strictest known attachment limit.
pub const DELIVERY_THRESHOLD: u64 = 49 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Route {
    Direct,
    Publish,
}

/// Inline or link, nothing in between.
pub fn route(size: u64) -> Route {
    if size <= DELIVERY_THRESHOLD {
        Route::Direct
    } else {
        Route::Publish
    }
}

/// Sends the finished file to the chat, either as a media message or, for
/// oversized files, as a public link obtained from the configured publisher.
pub async fn deliver(
    bot: &Bot,
    chat_id: ChatId,
    path: &Path,
    spec: &FormatSpec,
    publisher: &dyn Publisher,
) -> Result<(), AppError> {
    let size = tokio::fs::metadata(path).await?.len();
    match route(size) {
        Route::Direct => {
            info!(event = "deliver_direct", size, format = %spec.key);
            let file = InputFile::file(path.to_path_buf());
            match spec.delivery {
                Delivery::Audio => {
                    bot.send_audio(chat_id, file).await?;
                }
                Delivery::Video => {
                    bot.send_video(chat_id, file).await?;
                }
            }
            Ok(())
        }
        Route::Publish => {
            info!(event = "deliver_via_link", size, format = %spec.key);
            let published = publisher.publish(path).await?;
            let send_result = bot
                .send_message(
                    chat_id,
                    format!("The file is too large to send here.\nDownload it: {}", published.url),
                )
                .await;
            published.finish().await;
            send_result?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_sized_file_goes_direct() {
        assert_eq!(route(49 * 1024 * 1024), Route::Direct);
    }

    #[test]
    fn one_byte_over_threshold_goes_to_the_publisher() {
        assert_eq!(route(49 * 1024 * 1024 + 1), Route::Publish);
    }

    #[test]
    fn empty_file_goes_direct() {
        assert_eq!(route(0), Route::Direct);
    }
}
