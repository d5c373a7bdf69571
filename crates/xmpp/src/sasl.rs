use std::collections::HashSet;
use std::fmt;

use sasl::client::Mechanism;
use sasl::client::mechanisms::{Plain, Scram};
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::{ChannelBinding, Credentials};

use crate::error::ConnectionError;

/// SASL mechanisms we can drive, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedMechanism {
    ScramSha256,
    ScramSha1,
    Plain,
}

impl SelectedMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            SelectedMechanism::ScramSha256 => "SCRAM-SHA-256",
            SelectedMechanism::ScramSha1 => "SCRAM-SHA-1",
            SelectedMechanism::Plain => "PLAIN",
        }
    }
}

impl fmt::Display for SelectedMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const MECHANISM_PREFERENCE: &[SelectedMechanism] = &[
    SelectedMechanism::ScramSha256,
    SelectedMechanism::ScramSha1,
    SelectedMechanism::Plain,
];

/// Strongest mechanism the server offers. PLAIN is only eligible when
/// `allow_plain` is set (an encrypted stream or explicit account opt-in).
pub fn select_mechanism(
    server_mechanisms: &HashSet<String>,
    allow_plain: bool,
) -> Option<SelectedMechanism> {
    MECHANISM_PREFERENCE
        .iter()
        .filter(|m| allow_plain || **m != SelectedMechanism::Plain)
        .find(|m| server_mechanisms.contains(m.name()))
        .copied()
}

pub fn credentials(login: &str, password: &str) -> Credentials {
    Credentials::default()
        .with_username(login)
        .with_password(password)
        .with_channel_binding(ChannelBinding::Unsupported)
}

/// Instantiate the client side of `selected` for `credentials`.
pub fn build_mechanism(
    selected: SelectedMechanism,
    credentials: &Credentials,
) -> Result<Box<dyn Mechanism + Send>, ConnectionError> {
    let credentials = credentials.clone();
    let built = match selected {
        SelectedMechanism::ScramSha256 => Scram::<Sha256>::from_credentials(credentials).map(boxed),
        SelectedMechanism::ScramSha1 => Scram::<Sha1>::from_credentials(credentials).map(boxed),
        SelectedMechanism::Plain => Plain::from_credentials(credentials).map(boxed),
    };
    built.map_err(|error| {
        ConnectionError::AuthenticationFailed(format!("cannot start {selected}: {error:?}"))
    })
}

fn boxed<M: Mechanism + Send + 'static>(mechanism: M) -> Box<dyn Mechanism + Send> {
    Box::new(mechanism)
}
