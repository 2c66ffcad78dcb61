//! Welcome negotiation.
//!
//! The first encrypted message of every session is the server's
//! [`Welcome`]. [`negotiate`] turns it into a [`ServerPolicy`] or refuses
//! the server with [`RvlinkError::Unwelcome`]:
//!
//! - the protocol version must equal [`PROTOCOL_VERSION`];
//! - every property the server marks required must be understood;
//! - the max message size version must be known;
//! - the ping interval is clamped to what the server tolerates.

use std::sync::Arc;
use std::time::Duration;

use rvlink_types::{Result, RvlinkError, ServerPolicy};
use rvlink_wire::message::{
    max_msg_size_for_version, supported_server_properties, Command, Welcome, PROP_EXPIRATION_DAYS,
    PROP_EXPIRATION_DAYS_DEFAULT, PROP_MAX_MSG_SIZE_VERSION, PROP_PING_LIMIT,
    PROP_PING_LIMIT_DEFAULT_SECS, PROP_SERVER_TIME, PROTOCOL_VERSION,
};

use crate::server_kx::MessageSource;

/// Callback invoked once for every negotiation failure.
pub type UnwelcomeHandler = Arc<dyn Fn(&RvlinkError) + Send + Sync>;

/// Prefix of the error returned when the server's ping limit would force
/// a ping interval below the configured floor.
pub const PING_LIMIT_TOO_RESTRICTIVE: &str = "server ping limit too restrictive";

fn unwelcome(reason: String) -> RvlinkError {
    RvlinkError::Unwelcome { reason }
}

fn parse_prop<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| unwelcome(format!("invalid value {value:?} for server property {key}")))
}

/// Chooses the ping interval given the configured interval and the
/// server's limit.
///
/// - a configured interval of zero disables pings;
/// - an interval within the limit is used as is;
/// - otherwise three quarters of the limit is used, unless that falls
///   below `floor`.
pub fn clamp_ping_interval(configured: Duration, limit: Duration, floor: Duration) -> Result<Duration> {
    if configured.is_zero() || configured <= limit {
        return Ok(configured);
    }
    let clamped = limit * 3 / 4;
    if clamped < floor {
        return Err(unwelcome(format!(
            "{PING_LIMIT_TOO_RESTRICTIVE}: limit {}s leaves {}ms, below the {}s minimum",
            limit.as_secs(),
            clamped.as_millis(),
            floor.as_secs()
        )));
    }
    Ok(clamped)
}

/// Validates a welcome and derives the session policy.
pub fn negotiate(welcome: &Welcome, ping_interval: Duration, min_ping_interval: Duration) -> Result<ServerPolicy> {
    if welcome.version != PROTOCOL_VERSION {
        return Err(unwelcome(format!(
            "protocol version mismatch: got {} wanted {PROTOCOL_VERSION}",
            welcome.version
        )));
    }

    let supported = supported_server_properties();
    let mut server_time = welcome.server_time;
    let mut ping_limit_secs = PROP_PING_LIMIT_DEFAULT_SECS;
    let mut size_version = 0u64;
    let mut expiration_days = PROP_EXPIRATION_DAYS_DEFAULT;

    for prop in &welcome.properties {
        if !supported.iter().any(|s| s.key == prop.key) {
            if prop.required {
                return Err(unwelcome(format!("unhandled server property: {}", prop.key)));
            }
            tracing::debug!(key = %prop.key, "ignoring optional server property");
            continue;
        }
        match prop.key.as_str() {
            PROP_SERVER_TIME => server_time = parse_prop(&prop.key, &prop.value)?,
            PROP_PING_LIMIT => ping_limit_secs = parse_prop(&prop.key, &prop.value)?,
            PROP_MAX_MSG_SIZE_VERSION => size_version = parse_prop(&prop.key, &prop.value)?,
            PROP_EXPIRATION_DAYS => expiration_days = parse_prop(&prop.key, &prop.value)?,
            _ => {}
        }
    }

    let max_msg_size = max_msg_size_for_version(size_version)
        .ok_or_else(|| unwelcome("server did not send a supported max msg size version".into()))?;

    let ping = clamp_ping_interval(ping_interval, Duration::from_secs(ping_limit_secs), min_ping_interval)?;

    Ok(ServerPolicy {
        server_time,
        ping_limit_secs,
        max_msg_size,
        expiration_days,
        ping_interval_ms: u64::try_from(ping.as_millis()).unwrap_or(u64::MAX),
    })
}

/// Reads the welcome from `source` and negotiates it. Any
/// [`RvlinkError::Unwelcome`] is reported to `on_unwelcome` exactly once
/// before being returned.
pub async fn attempt_welcome<S: MessageSource + ?Sized>(
    source: &mut S,
    ping_interval: Duration,
    min_ping_interval: Duration,
    on_unwelcome: Option<&UnwelcomeHandler>,
) -> Result<ServerPolicy> {
    let msg = source.read_msg().await?;
    let result = match msg.command {
        Command::Welcome(welcome) => negotiate(&welcome, ping_interval, min_ping_interval),
        other => Err(RvlinkError::Protocol {
            reason: format!("expected welcome, got {}", other.name()),
        }),
    };
    if let Err(e) = &result {
        if e.is_unwelcome() {
            if let Some(cb) = on_unwelcome {
                cb(e);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rvlink_wire::message::{Message, ServerProperty};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct OneShot(Option<Message>);

    #[async_trait]
    impl MessageSource for OneShot {
        async fn read_msg(&mut self) -> Result<Message> {
            self.0.take().ok_or_else(|| RvlinkError::Network {
                reason: "closed".into(),
            })
        }
    }

    fn prop(key: &str, value: &str, required: bool) -> ServerProperty {
        ServerProperty {
            key: key.into(),
            value: value.into(),
            required,
        }
    }

    fn welcome(props: Vec<ServerProperty>) -> Welcome {
        Welcome {
            version: PROTOCOL_VERSION,
            server_time: 1_700_000_000,
            properties: props,
        }
    }

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn ping_interval_table() {
        let floor = 15 * SEC;
        let cases = [
            (120 * SEC, 300 * SEC, Some(120 * SEC)),
            (600 * SEC, 300 * SEC, Some(225 * SEC)),
            (5 * SEC, 10 * SEC, Some(5 * SEC)),
            (Duration::ZERO, 10 * SEC, Some(Duration::ZERO)),
            (60 * SEC, 300 * SEC, Some(60 * SEC)),
            (60 * SEC, 10 * SEC, None),
        ];
        for (configured, limit, want) in cases {
            let got = clamp_ping_interval(configured, limit, floor);
            match want {
                Some(d) => assert_eq!(got.ok(), Some(d), "{configured:?} / {limit:?}"),
                None => assert!(
                    got.is_err_and(|e| matches!(
                        e,
                        RvlinkError::Unwelcome { ref reason } if reason.starts_with(PING_LIMIT_TOO_RESTRICTIVE)
                    )),
                    "{configured:?} / {limit:?}"
                ),
            }
        }
    }

    #[test]
    fn defaults_without_optional_props() -> std::result::Result<(), RvlinkError> {
        let policy = negotiate(&welcome(vec![prop(PROP_SERVER_TIME, "42", true)]), 60 * SEC, 15 * SEC)?;
        assert_eq!(policy.server_time, 42);
        assert_eq!(policy.ping_limit_secs, PROP_PING_LIMIT_DEFAULT_SECS);
        assert_eq!(policy.max_msg_size, 1024 * 1024);
        assert_eq!(policy.expiration_days, PROP_EXPIRATION_DAYS_DEFAULT);
        assert_eq!(policy.ping_interval_ms, 60_000);
        Ok(())
    }

    #[test]
    fn version_mismatch() {
        let mut w = welcome(vec![]);
        w.version = PROTOCOL_VERSION + 1;
        let err = negotiate(&w, 60 * SEC, 15 * SEC).err();
        assert_eq!(
            err,
            Some(RvlinkError::Unwelcome {
                reason: format!(
                    "protocol version mismatch: got {} wanted {PROTOCOL_VERSION}",
                    PROTOCOL_VERSION + 1
                )
            })
        );
    }

    #[test]
    fn unknown_required_property_refused() {
        let err = negotiate(&welcome(vec![prop("quantum", "yes", true)]), 60 * SEC, 15 * SEC).err();
        assert_eq!(
            err,
            Some(RvlinkError::Unwelcome {
                reason: "unhandled server property: quantum".into()
            })
        );
    }

    #[test]
    fn unknown_optional_property_ignored() {
        assert!(negotiate(&welcome(vec![prop("quantum", "yes", false)]), 60 * SEC, 15 * SEC).is_ok());
    }

    #[test]
    fn unknown_size_version_refused() {
        let err = negotiate(
            &welcome(vec![prop(PROP_MAX_MSG_SIZE_VERSION, "99", false)]),
            60 * SEC,
            15 * SEC,
        )
        .err();
        assert_eq!(
            err,
            Some(RvlinkError::Unwelcome {
                reason: "server did not send a supported max msg size version".into()
            })
        );
    }

    #[tokio::test]
    async fn callback_fires_once_per_refusal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler: UnwelcomeHandler = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut bad = welcome(vec![]);
        bad.version = 1;
        let mut src = OneShot(Some(Message::new(0, Command::Welcome(bad))));
        let res = attempt_welcome(&mut src, 60 * SEC, 15 * SEC, Some(&handler)).await;
        assert!(res.is_err_and(|e| e.is_unwelcome()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut src = OneShot(Some(Message::new(0, Command::Welcome(welcome(vec![prop(
            PROP_PING_LIMIT,
            "10",
            false,
        )])))));
        let res = attempt_welcome(&mut src, 60 * SEC, 15 * SEC, Some(&handler)).await;
        assert!(res.is_err_and(|e| e.is_unwelcome()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let mut src = OneShot(Some(Message::new(0, Command::Welcome(welcome(vec![])))));
        assert!(attempt_welcome(&mut src, 60 * SEC, 15 * SEC, Some(&handler)).await.is_ok());

        let mut src = OneShot(Some(Message::new(0, Command::Pong)));
        let res = attempt_welcome(&mut src, 60 * SEC, 15 * SEC, Some(&handler)).await;
        assert!(matches!(res, Err(RvlinkError::Protocol { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
