//! Client side of session establishment.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::channel::{Channel, ChannelConfig};
use crate::envelope::{
    codes, Authentication, AuthenticationScheme, Envelope, GuestAuthentication, Identity,
    KeyAuthentication, Node, PlainAuthentication, Reason, Session, SessionCompression,
    SessionEncryption, SessionState,
};
use crate::error::LimeError;
use crate::transport::Transport;

/// Identity and credentials a client presents while establishing a session.
#[derive(Debug, Clone)]
pub struct ClientEstablishment {
    pub identity: Identity,
    /// Requested instance name; the server may assign one when absent.
    pub instance: Option<String>,
    pub scheme: AuthenticationScheme,
    pub authentication: Authentication,
}

impl ClientEstablishment {
    pub fn guest(identity: Identity) -> Self {
        Self {
            identity,
            instance: None,
            scheme: AuthenticationScheme::Guest,
            authentication: Authentication::Guest(GuestAuthentication {}),
        }
    }

    /// Plain credentials; the password travels base64-encoded.
    pub fn plain(identity: Identity, password: &str) -> Self {
        Self {
            identity,
            instance: None,
            scheme: AuthenticationScheme::Plain,
            authentication: Authentication::Plain(PlainAuthentication {
                password: BASE64.encode(password),
            }),
        }
    }

    pub fn key(identity: Identity, key: &str) -> Self {
        Self {
            identity,
            instance: None,
            scheme: AuthenticationScheme::Key,
            authentication: Authentication::Key(KeyAuthentication {
                key: BASE64.encode(key),
            }),
        }
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    fn node(&self) -> Node {
        Node::new(self.identity.clone(), self.instance.clone())
    }
}

/// Drives the client half of the negotiation and returns the established
/// channel.
///
/// # Errors
/// `Timeout` when a step exceeds `config.negotiation_step_timeout` (the peer
/// is informed with reason code 12), `SessionFailed` when the server
/// terminates the negotiation, `Authorization` when no advertised option is
/// supported locally.
pub async fn establish(
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    establishment: ClientEstablishment,
    ct: &CancellationToken,
) -> Result<Arc<Channel>, LimeError> {
    let step_timeout = config.negotiation_step_timeout;

    let new_session = Session::with_state(SessionState::New);
    transport.send(Envelope::Session(new_session)).await?;

    // Negotiation: pick the first option the server advertises that the
    // local transport supports.
    let negotiating = next_session(&transport, step_timeout, ct).await?;
    expect_state(&negotiating, SessionState::Negotiating)?;
    let session_id = negotiating.id;
    let encryption = choose(
        negotiating.encryption_options.as_deref(),
        &transport.supported_encryption(),
        SessionEncryption::None,
    );
    let compression = choose(
        negotiating.compression_options.as_deref(),
        &transport.supported_compression(),
        SessionCompression::None,
    );
    let (encryption, compression) = match (encryption, compression) {
        (Some(encryption), Some(compression)) => (encryption, compression),
        _ => {
            let failure = Session::failure(
                session_id,
                Reason::new(
                    codes::AUTHORIZATION_UNSUPPORTED_OPTION,
                    "no mutually supported transport option",
                ),
            );
            let _ = transport.send(Envelope::Session(failure)).await;
            return Err(LimeError::Authorization(
                "no mutually supported encryption/compression option".into(),
            ));
        }
    };

    let mut choice = Session::with_state(SessionState::Negotiating);
    choice.id = session_id;
    choice.encryption = Some(encryption);
    choice.compression = Some(compression);
    transport.send(Envelope::Session(choice)).await?;
    transport.set_encryption(encryption).await?;
    transport.set_compression(compression).await?;

    // Authentication: present credentials if the chosen scheme is offered.
    let authenticating = next_session(&transport, step_timeout, ct).await?;
    expect_state(&authenticating, SessionState::Authenticating)?;
    let offered = authenticating.scheme_options.unwrap_or_default();
    if !offered.contains(&establishment.scheme) {
        let failure = Session::failure(
            session_id,
            Reason::new(
                codes::AUTHORIZATION_UNSUPPORTED_OPTION,
                "authentication scheme not offered",
            ),
        );
        let _ = transport.send(Envelope::Session(failure)).await;
        return Err(LimeError::Authentication(format!(
            "scheme {:?} not offered by the server",
            establishment.scheme
        )));
    }

    let mut credentials = Session::with_state(SessionState::Authenticating);
    credentials.id = session_id;
    credentials.from = Some(establishment.node());
    credentials.scheme = Some(establishment.scheme);
    credentials.authentication = Some(establishment.authentication.clone());
    transport.send(Envelope::Session(credentials)).await?;

    let established = next_session(&transport, step_timeout, ct).await?;
    expect_state(&established, SessionState::Established)?;
    let session_id = established
        .id
        .ok_or_else(|| LimeError::Protocol("established session without id".into()))?;

    info!(target: "lime::session", %session_id, "session established");
    Ok(Channel::start(
        transport,
        config,
        session_id,
        established.to.clone(),
        established.from.clone(),
    ))
}

fn choose<T: Copy + PartialEq>(advertised: Option<&[T]>, supported: &[T], default: T) -> Option<T> {
    match advertised {
        // An omitted option list means the peer does not negotiate the
        // concern; stay on the default.
        None => Some(default),
        Some(options) => options
            .iter()
            .copied()
            .find(|option| supported.contains(option)),
    }
}

fn expect_state(session: &Session, expected: SessionState) -> Result<(), LimeError> {
    if session.state == expected {
        Ok(())
    } else {
        Err(LimeError::Protocol(format!(
            "expected session state '{:?}', got '{:?}'",
            expected, session.state
        )))
    }
}

pub(crate) async fn next_session(
    transport: &Arc<dyn Transport>,
    step_timeout: Duration,
    ct: &CancellationToken,
) -> Result<Session, LimeError> {
    let received = tokio::select! {
        biased;
        _ = ct.cancelled() => return Err(LimeError::Cancelled),
        received = tokio::time::timeout(step_timeout, transport.receive()) => received,
    };
    let envelope = match received {
        Ok(result) => result?,
        Err(_) => {
            let failure = Session::failure(
                None,
                Reason::new(codes::SESSION_TIMEOUT, "negotiation step timed out"),
            );
            let _ = transport.send(Envelope::Session(failure)).await;
            return Err(LimeError::Timeout("negotiation step timed out".into()));
        }
    };
    match envelope {
        Envelope::Session(session) => {
            if session.state == SessionState::Failed {
                Err(LimeError::SessionFailed(session.reason.unwrap_or(Reason {
                    code: codes::SESSION_ERROR,
                    description: None,
                })))
            } else {
                Ok(session)
            }
        }
        other => Err(LimeError::Protocol(format!(
            "expected session envelope during negotiation, got {}",
            other.kind()
        ))),
    }
}
