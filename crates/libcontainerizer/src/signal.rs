//! Signals as they arrive through the container API and their POSIX mapping.

use std::convert::TryFrom;
use std::fmt::Display;
use std::str::FromStr;

use nix::sys::signal::Signal as NixSignal;

/// A signal requested by an API client. Only terminate and kill can be
/// delivered to container processes; every other value is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiSignal(pub i32);

impl ApiSignal {
    pub const TERMINATE: ApiSignal = ApiSignal(0);
    pub const KILL: ApiSignal = ApiSignal(1);
}

impl Display for ApiSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignalError<T> {
    #[error("cannot convert signal {0} to a POSIX signal")]
    InvalidSignal(T),
}

/// POSIX signal delivered to a backing process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal(NixSignal);

impl TryFrom<ApiSignal> for Signal {
    type Error = SignalError<i32>;

    fn try_from(signal: ApiSignal) -> Result<Self, Self::Error> {
        match signal {
            ApiSignal::TERMINATE => Ok(Signal(NixSignal::SIGTERM)),
            ApiSignal::KILL => Ok(Signal(NixSignal::SIGKILL)),
            ApiSignal(other) => Err(SignalError::InvalidSignal(other)),
        }
    }
}

impl FromStr for ApiSignal {
    type Err = SignalError<String>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "15" | "TERM" | "SIGTERM" => Ok(ApiSignal::TERMINATE),
            "9" | "KILL" | "SIGKILL" => Ok(ApiSignal::KILL),
            _ => Err(SignalError::InvalidSignal(s.to_string())),
        }
    }
}

impl From<NixSignal> for Signal {
    fn from(s: NixSignal) -> Self {
        Signal(s)
    }
}

impl Signal {
    pub fn into_raw(self) -> NixSignal {
        self.0
    }

    pub fn as_i32(self) -> i32 {
        self.0 as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_signal_mapping() {
        assert_eq!(
            Signal::try_from(ApiSignal::TERMINATE).unwrap().into_raw(),
            NixSignal::SIGTERM
        );
        assert_eq!(
            Signal::try_from(ApiSignal::KILL).unwrap().into_raw(),
            NixSignal::SIGKILL
        );
    }

    #[test]
    fn test_unknown_api_signal() {
        let err = Signal::try_from(ApiSignal(-1)).unwrap_err();
        assert_eq!(err.to_string(), "cannot convert signal -1 to a POSIX signal");
    }

    #[test]
    fn test_parse_api_signal() {
        for (input, expected) in [
            ("term", ApiSignal::TERMINATE),
            ("SIGTERM", ApiSignal::TERMINATE),
            ("15", ApiSignal::TERMINATE),
            ("kill", ApiSignal::KILL),
            ("9", ApiSignal::KILL),
        ] {
            assert_eq!(input.parse::<ApiSignal>().unwrap(), expected, "{input}");
        }
        assert!("hup".parse::<ApiSignal>().is_err());
    }
}
