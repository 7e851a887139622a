use crate::{
    config::Config,
    cookies::CookieRefresher,
    deliver,
    download::{begin_gated, is_video_url, Attempt, BeginOutcome},
    error::{hint_for_ytdlp_error, AppError},
    estimator,
    formats::{self, human_size, FormatSpec},
    lock::LockStore,
    publish::Publisher,
    session::SessionStore,
    subscription::{SubscriptionGate, CHECK_SUBSCRIPTION_CALLBACK},
    users::UserDirectory,
    ytdlp::{DownloadRequest, Downloader, MediaProvider, ProgressState},
};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use teloxide::{
    dispatching::DpHandlerDescription,
    prelude::*,
    types::{KeyboardButton, KeyboardMarkup, MessageId, User},
    ApiError, RequestError,
};
use tokio::time;
use tracing::{error, info, warn};

pub const PROGRESS_UPDATE_EVERY: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppServices {
    pub config: Arc<Config>,
    pub sessions: SessionStore,
    pub users: UserDirectory,
    pub locks: Arc<dyn LockStore>,
    pub media: Arc<dyn MediaProvider>,
    pub downloader: Arc<dyn Downloader>,
    pub publisher: Arc<dyn Publisher>,
    pub gate: Arc<SubscriptionGate>,
    pub cookies: Arc<CookieRefresher>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BotCmd {
    Start,
    Health,
    Locks,
    RefreshCookies,
    CheckSubscription,
    Format(String),
}

pub fn build_handler(
) -> Handler<'static, DependencyMap, Result<(), AppError>, DpHandlerDescription> {
    dptree::entry()
        .branch(
            Update::filter_message()
                .filter_map(extract_command)
                .endpoint(handle_command),
        )
        .branch(
            Update::filter_message()
                .filter_map(extract_url)
                .endpoint(handle_url),
        )
        .branch(Update::filter_callback_query().endpoint(handle_callback))
}

fn extract_command(msg: Message) -> Option<(Message, BotCmd)> {
    let cmd = parse_command(msg.text()?)?;
    Some((msg, cmd))
}

fn extract_url(msg: Message) -> Option<(Message, String)> {
    let text = msg.text()?.trim().to_string();
    if is_video_url(&text) {
        Some((msg, text))
    } else {
        None
    }
}

pub fn parse_command(text: &str) -> Option<BotCmd> {
    let rest = text.trim().strip_prefix('/')?;
    let token = rest.split_whitespace().next()?;
    let name = token.split('@').next().unwrap_or(token);
    match name {
        "start" => Some(BotCmd::Start),
        "health" => Some(BotCmd::Health),
        "locks" => Some(BotCmd::Locks),
        "refresh_cookies" => Some(BotCmd::RefreshCookies),
        "check_subscription" => Some(BotCmd::CheckSubscription),
        other => formats::lookup(other).map(|spec| BotCmd::Format(spec.key.to_string())),
    }
}

/// What a gated interaction may do with the user record. A record is only
/// ever created for a subscribed newcomer; unsubscribed strangers stay out
/// of the directory entirely.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RegistrationAction {
    Keep,
    Register,
    Refuse,
}

fn registration_action(already_registered: bool, subscribed: bool) -> RegistrationAction {
    if already_registered {
        RegistrationAction::Keep
    } else if subscribed {
        RegistrationAction::Register
    } else {
        RegistrationAction::Refuse
    }
}

/// Registers the user on first gated contact, or confirms an existing record.
/// Unknown users who are not subscribed get onboarding instructions instead.
async fn ensure_user(
    bot: &Bot,
    services: &AppServices,
    user: &User,
    chat_id: ChatId,
) -> Result<bool, AppError> {
    let already_registered = services.users.get(user.id.0).await?.is_some();
    if already_registered {
        return Ok(true);
    }

    let subscribed = services.gate.is_subscribed(bot, user.id).await;
    match registration_action(already_registered, subscribed) {
        RegistrationAction::Keep => Ok(true),
        RegistrationAction::Register => {
            match services
                .users
                .create(user.id.0, user.username.as_deref(), chat_id.0, Utc::now())
                .await
            {
                Ok(()) => {
                    info!(event = "user_registered", user_id = user.id.0);
                    Ok(true)
                }
                Err(err) => {
                    error!(event = "user_register_failed", user_id = user.id.0, error = %err);
                    bot.send_message(chat_id, "Registration failed. Try again later.")
                        .await?;
                    Ok(false)
                }
            }
        }
        RegistrationAction::Refuse => {
            bot.send_message(
                chat_id,
                "To use the bot:\n1. Subscribe to the required channels\n2. Press /start",
            )
            .await?;
            Ok(false)
        }
    }
}

async fn handle_command(
    bot: Bot,
    services: AppServices,
    msg_and_cmd: (Message, BotCmd),
) -> Result<(), AppError> {
    let (msg, cmd) = msg_and_cmd;
    let chat_id = msg.chat.id;
    let Some(user) = msg.from().cloned() else {
        return Ok(());
    };

    match cmd {
        BotCmd::Start => handle_start(&bot, &services, &user, chat_id).await,
        BotCmd::Health => {
            bot.send_message(chat_id, "Bot is running.").await?;
            Ok(())
        }
        BotCmd::Locks => {
            if user.id.0 != services.config.admin_user_id {
                bot.send_message(chat_id, "No access.").await?;
                return Ok(());
            }
            let locks = services.locks.list_active().await?;
            let text = if locks.is_empty() {
                "No active locks.".to_string()
            } else {
                format!("Active locks:\n{}", locks.join("\n"))
            };
            bot.send_message(chat_id, text).await?;
            Ok(())
        }
        BotCmd::RefreshCookies => {
            if user.id.0 != services.config.admin_user_id {
                bot.send_message(chat_id, "No access.").await?;
                return Ok(());
            }
            bot.send_message(chat_id, "Refreshing cookies…").await?;
            match services.cookies.refresh().await {
                Ok(()) => {
                    bot.send_message(chat_id, "Cookies refreshed.").await?;
                }
                Err(err) => {
                    error!(event = "cookie_refresh_command_failed", error = %err);
                    bot.send_message(chat_id, "Cookie refresh failed. Check the logs.")
                        .await?;
                }
            }
            Ok(())
        }
        BotCmd::CheckSubscription => {
            if services.gate.is_subscribed(&bot, user.id).await {
                bot.send_message(
                    chat_id,
                    "You are subscribed to all channels! You can download videos now.",
                )
                .await?;
            } else {
                services.gate.request_subscription(&bot, chat_id).await?;
            }
            Ok(())
        }
        BotCmd::Format(key) => handle_format(bot, services, msg, user, key).await,
    }
}

async fn handle_start(
    bot: &Bot,
    services: &AppServices,
    user: &User,
    chat_id: ChatId,
) -> Result<(), AppError> {
    if !ensure_user(bot, services, user, chat_id).await? {
        return Ok(());
    }
    services.users.touch_best_effort(user.id.0).await;

    if !services.gate.is_subscribed(bot, user.id).await {
        services.gate.request_subscription(bot, chat_id).await?;
        return Ok(());
    }

    bot.send_message(
        chat_id,
        format!("Hi, {}!\nSend a video or audio link.", user.first_name),
    )
    .await?;
    Ok(())
}

async fn handle_url(
    bot: Bot,
    services: AppServices,
    msg_and_url: (Message, String),
) -> Result<(), AppError> {
    let (msg, url) = msg_and_url;
    let chat_id = msg.chat.id;
    let Some(user) = msg.from().cloned() else {
        return Ok(());
    };

    bot.send_message(chat_id, "Please wait…").await?;

    if !services.gate.is_subscribed(&bot, user.id).await {
        services.gate.request_subscription(&bot, chat_id).await?;
        return Ok(());
    }

    if !ensure_user(&bot, &services, &user, chat_id).await? {
        return Ok(());
    }

    services.sessions.set_url(user.id.0, url.clone());

    // Best-effort size annotations; 0 means unknown and the format is
    // listed without one.
    let mut sizes = Vec::with_capacity(formats::catalog().len());
    let mut title: Option<String> = None;
    for spec in formats::catalog() {
        let estimate = estimator::estimate(services.media.as_ref(), &url, spec).await;
        if title.is_none() {
            title = estimate.title;
        }
        sizes.push((spec.key, estimate.bytes));
    }
    services.sessions.set_title(user.id.0, title);

    bot.send_message(chat_id, format_menu_text(&sizes))
        .reply_markup(format_keyboard())
        .await?;
    Ok(())
}

pub fn format_menu_text(sizes: &[(&str, u64)]) -> String {
    let mut text = String::from("Choose a quality:\n\n");
    for (key, size) in sizes {
        if *size > 0 {
            text.push_str(&format!("/{key} - {}\n", human_size(*size)));
        } else {
            text.push_str(&format!("/{key}\n"));
        }
    }
    text
}

pub fn format_keyboard() -> KeyboardMarkup {
    let rows: Vec<Vec<KeyboardButton>> = formats::catalog()
        .chunks(3)
        .map(|chunk| {
            chunk
                .iter()
                .map(|spec| KeyboardButton::new(format!("/{}", spec.key)))
                .collect()
        })
        .collect();
    KeyboardMarkup::new(rows).resize_keyboard(true)
}

async fn handle_format(
    bot: Bot,
    services: AppServices,
    msg: Message,
    user: User,
    format_key: String,
) -> Result<(), AppError> {
    let chat_id = msg.chat.id;

    if !ensure_user(&bot, &services, &user, chat_id).await? {
        return Ok(());
    }
    if !services.gate.is_subscribed(&bot, user.id).await {
        services.gate.request_subscription(&bot, chat_id).await?;
        return Ok(());
    }

    let outcome = match begin_gated(
        services.locks.clone(),
        services.sessions.pending_url(user.id.0),
        &format_key,
        user.id.0,
        services.config.lock_ttl,
        services.config.work_dir.clone(),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            // An unreachable lock store must never pass for a free lock.
            error!(event = "lock_store_unavailable", error = %err);
            bot.send_message(
                chat_id,
                "The service is temporarily unavailable. Try again later.",
            )
            .await?;
            return Ok(());
        }
    };

    let (attempt, url, spec) = match outcome {
        BeginOutcome::Refused(refusal) => {
            bot.send_message(chat_id, refusal.user_message()).await?;
            return Ok(());
        }
        BeginOutcome::Contended => {
            bot.send_message(chat_id, "You already have a download running. Please wait.")
                .await?;
            return Ok(());
        }
        BeginOutcome::Ready { attempt, url, spec } => (attempt, url, spec),
    };

    services.users.touch_best_effort(user.id.0).await;
    let title = services.sessions.title(user.id.0);

    let status = bot.send_message(chat_id, "Please wait…").await?;
    tokio::spawn(run_download_task(
        bot,
        services,
        attempt,
        url,
        spec,
        title,
        chat_id,
        status.id,
    ));
    Ok(())
}

/// Downloading, locating, delivering, cleanup. Cleanup runs whatever happened
/// before it, and the pending URL is cleared either way.
async fn run_download_task(
    bot: Bot,
    services: AppServices,
    attempt: Attempt,
    url: String,
    spec: &'static FormatSpec,
    title: Option<String>,
    chat_id: ChatId,
    status_id: MessageId,
) {
    let user_id = attempt.user_id;
    let progress = ProgressState::new();

    let (done_tx, mut done_rx) = tokio::sync::watch::channel(false);
    let progress_state = progress.clone();
    let progress_bot = bot.clone();
    let progress_task = tokio::spawn(async move {
        let mut ticker = time::interval(PROGRESS_UPDATE_EVERY);
        let mut last_text: Option<String> = None;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let text = progress_state.build_text(&title).await;
                    if last_text.as_deref() == Some(text.as_str()) {
                        continue;
                    }
                    match progress_bot.edit_message_text(chat_id, status_id, text.clone()).await {
                        Ok(_) => {
                            last_text = Some(text);
                        }
                        Err(err) if is_message_not_modified(&err) => {
                            last_text = Some(text);
                        }
                        Err(err) => {
                            warn!(event = "progress_edit_failed", error = %err);
                        }
                    }
                }
                _ = done_rx.changed() => {
                    break;
                }
            }
        }
    });

    let request = DownloadRequest {
        url,
        spec,
        output_prefix: attempt.output_prefix(),
        progress,
    };
    let download_result = services.downloader.download(request).await;

    let _ = done_tx.send(true);
    let _ = progress_task.await;

    let outcome: Result<(), AppError> = async {
        download_result?;
        let _ = bot
            .edit_message_text(chat_id, status_id, "Processing…")
            .await;
        let path = attempt.locate(spec).await?;
        deliver::deliver(&bot, chat_id, &path, spec, services.publisher.as_ref()).await?;
        Ok(())
    }
    .await;

    match outcome {
        Ok(()) => {
            if let Err(err) = bot.edit_message_text(chat_id, status_id, "Done.").await {
                if !is_message_not_modified(&err) {
                    warn!(event = "status_finalize_failed", error = %err);
                }
            }
        }
        Err(err) => {
            report_failure(&bot, chat_id, &err).await;
        }
    }

    attempt.finish().await;
    services.sessions.clear(user_id);
}

/// Exactly one user-facing message per failed attempt, with a specific hint
/// when the downloader's stderr is recognized. A user who blocked the bot
/// gets nothing; the failure is only logged.
async fn report_failure(bot: &Bot, chat_id: ChatId, err: &AppError) {
    error!(event = "download_attempt_failed", error = %err);

    if let AppError::Teloxide(req_err) = err {
        if is_transport_unreachable(req_err) {
            warn!(event = "user_unreachable", chat_id = chat_id.0);
            return;
        }
    }

    let text = match err {
        AppError::YtDlp(stderr) => match hint_for_ytdlp_error(stderr) {
            Some(hint) => format!("The download failed.\n{hint}"),
            None => "The download failed. Try again later.".to_string(),
        },
        AppError::FileNotFound(_) => {
            "The download finished but the file could not be found. Try again.".to_string()
        }
        AppError::Upload(_) => "Publishing the file failed. Try again later.".to_string(),
        _ => "An error occurred during the download.".to_string(),
    };

    if let Err(send_err) = bot.send_message(chat_id, text).await {
        if is_transport_unreachable(&send_err) {
            warn!(event = "user_unreachable", chat_id = chat_id.0);
        } else {
            warn!(event = "failure_report_failed", error = %send_err);
        }
    }
}

fn is_transport_unreachable(err: &RequestError) -> bool {
    matches!(
        err,
        RequestError::Api(ApiError::BotBlocked | ApiError::UserDeactivated)
    )
}

fn is_message_not_modified(err: &RequestError) -> bool {
    matches!(err, RequestError::Api(ApiError::MessageNotModified))
}

async fn handle_callback(
    bot: Bot,
    services: AppServices,
    q: CallbackQuery,
) -> Result<(), AppError> {
    let data = q.data.clone().unwrap_or_default();

    if data == CHECK_SUBSCRIPTION_CALLBACK {
        if services.gate.is_subscribed(&bot, q.from.id).await {
            if let Some(message) = q.message.clone() {
                bot.edit_message_text(
                    message.chat.id,
                    message.id,
                    "Subscription confirmed! You can download videos now.",
                )
                .await?;
            }
            bot.answer_callback_query(q.id).await?;
        } else {
            bot.answer_callback_query(q.id)
                .text("You have not subscribed to all channels yet!")
                .show_alert(true)
                .await?;
        }
        return Ok(());
    }

    bot.answer_callback_query(q.id).await?;
    Ok(())
}
