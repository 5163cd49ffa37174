//! Dispatcher (SPEC_FULL 4.8): the coordinator that pulls recipients from
//! an ingest stream, renders via C3, gates via C4, invokes C7, and records
//! via C5, exposing progress and a cooperative cancellation point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use crate::channels::ChannelAdapter;
use crate::delivery::writer::StatusUpdate;
use crate::delivery::DeliveryStore;
use crate::quota::QuotaManager;
use crate::template::Template;
use crate::types::{Channel, ChannelTracking, MessageStatus, Recipient, Session};

/// Cooperative cancellation flag (spec 4.8: "a context/cancel token is
/// threaded through"). The teacher's codebase has no cancellation-token
/// crate in its dependency stack, so this mirrors its plain-primitive style
/// rather than reaching for one.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for one dispatch run (spec 4.8).
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub channels: Vec<Channel>,
    pub per_message_delay: Duration,
    pub dry_run: bool,
    pub max_retries: u32,
    pub retry_base_seconds: f64,
    pub retry_cap_seconds: f64,
    pub max_channel_concurrency: usize,
    /// Upper bound on how long we'll sleep waiting for quota admission
    /// before re-checking (spec pseudocode: `sleep(min(wait_seconds, cap))`).
    pub quota_wait_cap_seconds: f64,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            channels: vec![Channel::Mail],
            per_message_delay: Duration::from_millis(0),
            dry_run: false,
            max_retries: 3,
            retry_base_seconds: 2.0,
            retry_cap_seconds: 300.0,
            max_channel_concurrency: 4,
            quota_wait_cap_seconds: 30.0,
        }
    }
}

/// One recipient/channel outcome emitted as dispatch progresses (spec 4.8:
/// "a stream of `(Recipient, Result)`").
#[derive(Debug, Clone)]
pub struct DispatchProgress {
    pub row_number: u64,
    pub channel: Channel,
    pub status: MessageStatus,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

/// The coordinator (spec 4.8 "Dispatcher").
pub struct Dispatcher {
    quota: Arc<QuotaManager>,
    delivery: Arc<DeliveryStore>,
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
}

impl Dispatcher {
    pub fn new(
        quota: Arc<QuotaManager>,
        delivery: Arc<DeliveryStore>,
        adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
    ) -> Self {
        Self {
            quota,
            delivery,
            adapters,
        }
    }

    /// Run one dispatch pass, pulling recipients from `recipients` until it
    /// closes or `cancel` is set, and return the closed [`Session`].
    ///
    /// Recipients are pulled one at a time from an `mpsc::Receiver` rather
    /// than a fully materialized list (spec 4.8: "never fully materialize
    /// the full recipient list"), and progress is emitted on `progress_tx`
    /// as each (recipient, channel) outcome is produced.
    pub async fn run(
        &self,
        mut recipients: mpsc::Receiver<Recipient>,
        template: &Template,
        options: &DispatchOptions,
        progress_tx: mpsc::Sender<DispatchProgress>,
        cancel: CancelToken,
    ) -> Session {
        let mut session = Session::start(
            options.channels.first().copied().unwrap_or(Channel::Mail),
            template.name.clone(),
        );

        let semaphores: HashMap<Channel, Arc<Semaphore>> = options
            .channels
            .iter()
            .map(|c| (*c, Arc::new(Semaphore::new(options.max_channel_concurrency.max(1)))))
            .collect();

        while let Some(recipient) = recipients.recv().await {
            if cancel.is_cancelled() {
                debug!("dispatch cancelled, draining in-flight work and stopping");
                break;
            }

            for &channel in &options.channels {
                if !recipient.has_required_field_for(channel) {
                    continue;
                }
                let rendered = template.render(channel, &recipient);
                let to = recipient.address_for(channel).to_string();
                let inter_segment_delay = template
                    .multi_message
                    .as_ref()
                    .map(|cfg| cfg.delay_seconds)
                    .unwrap_or(0.0);

                // A multi-message template sends its segments to one
                // recipient strictly in order, each as its own
                // DeliveryRecord (spec 4.3/4.8: "not parallelized").
                let pieces = split_into_sends(&rendered);
                let last = pieces.len().saturating_sub(1);
                for (i, piece) in pieces.into_iter().enumerate() {
                    let permit = semaphores
                        .get(&channel)
                        .expect("semaphore exists for every enabled channel")
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("semaphore is never closed while run() is alive");

                    let outcome = self
                        .dispatch_one(
                            recipient.row_number,
                            &channel,
                            &to,
                            &piece,
                            template.name.as_str(),
                            options,
                            &cancel,
                        )
                        .await;
                    drop(permit);

                    match &outcome.status {
                        MessageStatus::Sent | MessageStatus::Delivered | MessageStatus::Read => {
                            session.sent_total += 1;
                        }
                        MessageStatus::Failed => session.failed_total += 1,
                        _ => {}
                    }

                    if progress_tx.send(outcome).await.is_err() {
                        debug!("progress receiver dropped; dispatch continues without reporting");
                    }

                    if i < last && inter_segment_delay > 0.0 {
                        tokio::time::sleep(Duration::from_secs_f64(inter_segment_delay)).await;
                    }
                }
            }

            if !options.per_message_delay.is_zero() {
                tokio::time::sleep(options.per_message_delay).await;
            }
        }

        session.close();
        session
    }

    /// Render-gate-send-record for one (recipient, channel) pair, including
    /// the channel's multi-message segments (sent strictly in order) and
    /// the dispatcher-level retry policy.
    async fn dispatch_one(
        &self,
        row_number: u64,
        channel: &Channel,
        to: &str,
        rendered: &crate::template::RenderedMessage,
        template_name: &str,
        options: &DispatchOptions,
        cancel: &CancelToken,
    ) -> DispatchProgress {
        let Some(adapter) = self.adapters.get(channel) else {
            return DispatchProgress {
                row_number,
                channel: *channel,
                status: MessageStatus::Failed,
                message_id: None,
                error: Some(format!("no adapter configured for channel {channel}")),
            };
        };

        if options.dry_run {
            return DispatchProgress {
                row_number,
                channel: *channel,
                status: MessageStatus::Queued,
                message_id: None,
                error: None,
            };
        }

        let channel_tracking = if *channel == Channel::WhatsAppBrowser {
            ChannelTracking::None
        } else {
            ChannelTracking::Confirmed
        };

        let record_id = match self
            .delivery
            .create(
                to.to_string(),
                *channel,
                options.max_retries,
                Some(template_name.to_string()),
                None,
                None,
                channel_tracking,
            )
            .await
        {
            Ok(id) => id,
            Err(err) => {
                warn!(error = %err, "failed to create delivery record");
                return DispatchProgress {
                    row_number,
                    channel: *channel,
                    status: MessageStatus::Failed,
                    message_id: None,
                    error: Some(err.to_string()),
                };
            }
        };

        let kind = channel.as_str();
        let mut retry_count = 0u32;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.wait_for_quota(kind, options).await;

            let _ = self
                .delivery
                .transition(record_id, MessageStatus::Sending, StatusUpdate::default())
                .await;

            let send_result = adapter.send(to, rendered).await;
            let used_burst = send_result.is_ok();
            if let Err(err) = self.quota.record_request(kind, used_burst).await {
                warn!(error = %err, "failed to record quota usage");
            }

            match send_result {
                Ok(outcome) => {
                    if let Err(err) = self.delivery.set_message_id(record_id, outcome.message_id.clone()).await {
                        warn!(error = %err, "failed to attach message id");
                    }
                    let _ = self
                        .delivery
                        .transition(
                            record_id,
                            MessageStatus::Sent,
                            StatusUpdate {
                                sent_at: Some(chrono::Utc::now()),
                                ..Default::default()
                            },
                        )
                        .await;
                    return DispatchProgress {
                        row_number,
                        channel: *channel,
                        status: MessageStatus::Sent,
                        message_id: Some(outcome.message_id),
                        error: None,
                    };
                }
                Err(send_err) => {
                    let _ = self
                        .delivery
                        .transition(
                            record_id,
                            MessageStatus::Failed,
                            StatusUpdate {
                                failed_at: Some(chrono::Utc::now()),
                                error_code: Some(send_err.code.clone()),
                                error_message: Some(send_err.message.clone()),
                                ..Default::default()
                            },
                        )
                        .await;

                    if send_err.retriable && retry_count < options.max_retries {
                        retry_count += 1;
                        let backoff = retry_backoff_seconds(
                            retry_count,
                            options.retry_base_seconds,
                            options.retry_cap_seconds,
                        );
                        match self.delivery.retry(record_id).await {
                            Ok(true) => {
                                debug!(to, channel = %channel, retry_count, backoff, "retrying failed send");
                                tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                                continue;
                            }
                            _ => {
                                // Store disagrees retry is eligible (e.g. max_retries
                                // reached concurrently); fall through as terminal.
                            }
                        }
                    }

                    return DispatchProgress {
                        row_number,
                        channel: *channel,
                        status: MessageStatus::Failed,
                        message_id: None,
                        error: Some(send_err.message),
                    };
                }
            }
        }

        DispatchProgress {
            row_number,
            channel: *channel,
            status: MessageStatus::Failed,
            message_id: None,
            error: Some("dispatch cancelled before completion".to_string()),
        }
    }

    async fn wait_for_quota(&self, kind: &str, options: &DispatchOptions) {
        loop {
            match self.quota.can_make_request(kind, true).await {
                Ok((true, _)) => return,
                Ok((false, details)) => {
                    let wait = details
                        .wait_seconds
                        .unwrap_or(options.quota_wait_cap_seconds)
                        .min(options.quota_wait_cap_seconds);
                    tokio::time::sleep(Duration::from_secs_f64(wait.max(0.0))).await;
                }
                Err(err) => {
                    warn!(error = %err, "quota check failed, proceeding without admission");
                    return;
                }
            }
        }
    }
}

/// `min(base * 2^(retry_count-1), cap)` (spec 4.8 "Retry policy").
fn retry_backoff_seconds(retry_count: u32, base: f64, cap: f64) -> f64 {
    let delay = base * 2f64.powi(retry_count as i32 - 1);
    delay.min(cap)
}

/// Expand one rendered message into the ordered sequence of individual sends
/// it represents: a single send for non-multi-message mode, or one send per
/// segment, in order, for multi-message mode (spec 4.3 "multi-message mode").
fn split_into_sends(rendered: &crate::template::RenderedMessage) -> Vec<crate::template::RenderedMessage> {
    if rendered.segments.is_empty() {
        return vec![rendered.clone()];
    }
    rendered
        .segments
        .iter()
        .map(|segment| crate::template::RenderedMessage {
            channel: rendered.channel,
            subject: None,
            body: segment.clone(),
            segments: Vec::new(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_respects_cap() {
        assert_eq!(retry_backoff_seconds(1, 2.0, 300.0), 2.0);
        assert_eq!(retry_backoff_seconds(2, 2.0, 300.0), 4.0);
        assert_eq!(retry_backoff_seconds(3, 2.0, 300.0), 8.0);
        assert_eq!(retry_backoff_seconds(20, 2.0, 300.0), 300.0);
    }

    #[test]
    fn cancel_token_starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn single_message_is_not_split() {
        let rendered = crate::template::RenderedMessage {
            channel: Channel::Mail,
            subject: Some("hi".to_string()),
            body: "hello".to_string(),
            segments: Vec::new(),
        };
        let pieces = split_into_sends(&rendered);
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].body, "hello");
    }

    #[test]
    fn multi_message_segments_expand_in_order() {
        let rendered = crate::template::RenderedMessage {
            channel: Channel::WhatsAppApi,
            subject: None,
            body: "A\n\nB\n\nC".to_string(),
            segments: vec!["A".to_string(), "B".to_string(), "C".to_string()],
        };
        let pieces = split_into_sends(&rendered);
        let bodies: Vec<&str> = pieces.iter().map(|p| p.body.as_str()).collect();
        assert_eq!(bodies, vec!["A", "B", "C"]);
    }
}
