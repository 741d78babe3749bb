use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub private_key_path: String,
    #[serde(default)]
    pub key_passphrase: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            password: String::new(),
            private_key_path: String::new(),
            key_passphrase: String::new(),
        }
    }
}

impl ConnectionSettings {
    /// Copy without secrets, suitable for keeping on a session record.
    pub fn redacted(&self) -> Self {
        let mut s = self.clone();
        s.password.clear();
        s.key_passphrase.clear();
        s
    }

    pub fn display_target(&self) -> String {
        let host = self.host.trim();
        let user = self.username.trim();
        match (user.is_empty(), host.is_empty()) {
            (false, false) => format!("{user}@{host}"),
            (false, true) => format!("{user}@new"),
            (true, false) => format!("ssh@{host}"),
            (true, true) => "local".to_string(),
        }
    }
}

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(SessionId);
string_id!(TabId);
string_id!(TaskId);

impl SessionId {
    /// Process-unique id: creation time plus a counter.
    pub fn generate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        Self(format!("{millis:x}-{n}"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Ssh,
    Local,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl SessionStatus {
    /// Disconnected and error sessions may be replaced by a new connect.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub tab_id: TabId,
    pub kind: SessionKind,
    pub status: SessionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub error_message: Option<String>,
    pub connection: Option<ConnectionSettings>,
}

impl Session {
    pub fn connecting(
        id: SessionId,
        tab_id: TabId,
        kind: SessionKind,
        settings: &ConnectionSettings,
    ) -> Self {
        let connection = match kind {
            SessionKind::Ssh => Some(settings.redacted()),
            SessionKind::Local => None,
        };
        Self {
            id,
            tab_id,
            kind,
            status: SessionStatus::Connecting,
            created_at: OffsetDateTime::now_utc(),
            error_message: None,
            connection,
        }
    }

    pub fn title(&self) -> String {
        let base = self
            .connection
            .as_ref()
            .map(ConnectionSettings::display_target)
            .unwrap_or_else(|| "local".to_string());
        format!("{base} #{}", self.tab_id)
    }
}

/// Terminal size in character cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacted_settings_drop_secrets() {
        let settings = ConnectionSettings {
            host: "example.org".into(),
            username: "root".into(),
            password: "hunter2".into(),
            key_passphrase: "phrase".into(),
            ..Default::default()
        };
        let session = Session::connecting(
            SessionId::from("s1"),
            TabId::from("t1"),
            SessionKind::Ssh,
            &settings,
        );
        let stored = session.connection.as_ref().expect("ssh sessions keep their settings");
        assert!(stored.password.is_empty());
        assert!(stored.key_passphrase.is_empty());
        assert_eq!(stored.host, "example.org");
        assert_eq!(session.title(), "root@example.org #t1");
    }

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Error.is_terminal());
        assert!(SessionStatus::Disconnected.is_terminal());
        assert!(!SessionStatus::Connecting.is_terminal());
        assert!(!SessionStatus::Connected.is_terminal());
    }
}
