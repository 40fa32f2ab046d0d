//! Server side of session establishment.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::channel::client::next_session;
use crate::channel::{Channel, ChannelConfig};
use crate::envelope::{
    codes, Authentication, AuthenticationScheme, Envelope, Identity, Node, Reason, Session,
    SessionState,
};
use crate::error::LimeError;
use crate::transport::Transport;

/// Outcome of credential validation.
#[derive(Debug, Clone)]
pub enum AuthenticationResult {
    Accepted,
    Rejected(Reason),
}

/// Validates the credentials a client presents during the authenticating
/// step.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        identity: &Identity,
        scheme: AuthenticationScheme,
        authentication: Option<&Authentication>,
    ) -> AuthenticationResult;
}

/// Accepts any identity presenting the guest scheme.
#[derive(Debug, Default)]
pub struct GuestAuthenticator;

#[async_trait]
impl Authenticator for GuestAuthenticator {
    async fn authenticate(
        &self,
        _identity: &Identity,
        scheme: AuthenticationScheme,
        _authentication: Option<&Authentication>,
    ) -> AuthenticationResult {
        if scheme == AuthenticationScheme::Guest {
            AuthenticationResult::Accepted
        } else {
            AuthenticationResult::Rejected(Reason::new(
                codes::SESSION_AUTHENTICATION_FAILED,
                "only guest authentication is accepted",
            ))
        }
    }
}

/// What the server presents and accepts while establishing a session.
#[derive(Debug, Clone)]
pub struct ServerEstablishment {
    /// The server's own address, sent in the `established` envelope.
    pub node: Node,
    pub scheme_options: Vec<AuthenticationScheme>,
}

impl ServerEstablishment {
    pub fn new(node: Node, scheme_options: Vec<AuthenticationScheme>) -> Self {
        Self {
            node,
            scheme_options,
        }
    }
}

/// Drives the server half of the negotiation and returns the established
/// channel.
///
/// The tie-break policy is positional: the first option in the server's
/// advertised order that the client echoes wins, and a client that omits a
/// choice gets the first advertised option.
pub async fn accept(
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    establishment: ServerEstablishment,
    authenticator: Arc<dyn Authenticator>,
    ct: &CancellationToken,
) -> Result<Arc<Channel>, LimeError> {
    let step_timeout = config.negotiation_step_timeout;
    let session_id = Uuid::new_v4();

    let new_session = next_session(&transport, step_timeout, ct).await?;
    if new_session.state != SessionState::New {
        return reject(
            &transport,
            session_id,
            Reason::new(
                codes::VALIDATION_INVALID_ENVELOPE,
                "session must start in the new state",
            ),
        )
        .await;
    }

    let encryption_options = transport.supported_encryption();
    let compression_options = transport.supported_compression();
    let mut negotiating = Session::with_state(SessionState::Negotiating);
    negotiating.id = Some(session_id);
    negotiating.from = Some(establishment.node.clone());
    negotiating.encryption_options = Some(encryption_options.clone());
    negotiating.compression_options = Some(compression_options.clone());
    transport.send(Envelope::Session(negotiating)).await?;

    let choice = next_session(&transport, step_timeout, ct).await?;
    if choice.state != SessionState::Negotiating {
        return reject(
            &transport,
            session_id,
            Reason::new(
                codes::VALIDATION_INVALID_ENVELOPE,
                "expected a negotiating session envelope",
            ),
        )
        .await;
    }
    let encryption = choice
        .encryption
        .or_else(|| encryption_options.first().copied());
    let compression = choice
        .compression
        .or_else(|| compression_options.first().copied());
    let (encryption, compression) = match (encryption, compression) {
        (Some(encryption), Some(compression)) => (encryption, compression),
        _ => {
            return reject(
                &transport,
                session_id,
                Reason::new(
                    codes::AUTHORIZATION_UNSUPPORTED_OPTION,
                    "transport advertises no negotiable options",
                ),
            )
            .await;
        }
    };
    if !encryption_options.contains(&encryption) || !compression_options.contains(&compression) {
        return reject(
            &transport,
            session_id,
            Reason::new(
                codes::AUTHORIZATION_UNSUPPORTED_OPTION,
                "negotiated option was not advertised",
            ),
        )
        .await;
    }
    transport.set_encryption(encryption).await?;
    transport.set_compression(compression).await?;

    let mut authenticating = Session::with_state(SessionState::Authenticating);
    authenticating.id = Some(session_id);
    authenticating.from = Some(establishment.node.clone());
    authenticating.scheme_options = Some(establishment.scheme_options.clone());
    transport.send(Envelope::Session(authenticating)).await?;

    let credentials = next_session(&transport, step_timeout, ct).await?;
    if credentials.state != SessionState::Authenticating {
        return reject(
            &transport,
            session_id,
            Reason::new(
                codes::VALIDATION_INVALID_ENVELOPE,
                "expected an authenticating session envelope",
            ),
        )
        .await;
    }
    let scheme = match credentials.scheme {
        Some(scheme) if establishment.scheme_options.contains(&scheme) => scheme,
        _ => {
            return reject(
                &transport,
                session_id,
                Reason::new(
                    codes::AUTHORIZATION_UNSUPPORTED_OPTION,
                    "authentication scheme was not offered",
                ),
            )
            .await;
        }
    };
    let claimed = match credentials.from {
        Some(node) => node,
        None => {
            return reject(
                &transport,
                session_id,
                Reason::new(
                    codes::VALIDATION_INVALID_ENVELOPE,
                    "authenticating session must carry the client node",
                ),
            )
            .await;
        }
    };

    match authenticator
        .authenticate(&claimed.identity, scheme, credentials.authentication.as_ref())
        .await
    {
        AuthenticationResult::Accepted => {}
        AuthenticationResult::Rejected(reason) => {
            let description = reason.to_string();
            let failure = Session::failure(Some(session_id), reason);
            let _ = transport.send(Envelope::Session(failure)).await;
            return Err(LimeError::Authentication(description));
        }
    }

    // Assign an instance when the client did not request one.
    let client_node = Node::new(
        claimed.identity,
        Some(
            claimed
                .instance
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        ),
    );

    let mut established = Session::with_state(SessionState::Established);
    established.id = Some(session_id);
    established.from = Some(establishment.node.clone());
    established.to = Some(client_node.clone());
    transport.send(Envelope::Session(established)).await?;

    info!(target: "lime::session", %session_id, client = %client_node, "session accepted");
    Ok(Channel::start(
        transport,
        config,
        session_id,
        Some(establishment.node),
        Some(client_node),
    ))
}

async fn reject<T>(
    transport: &Arc<dyn Transport>,
    session_id: Uuid,
    reason: Reason,
) -> Result<T, LimeError> {
    let description = reason.to_string();
    let code = reason.code;
    let failure = Session::failure(Some(session_id), reason);
    let _ = transport.send(Envelope::Session(failure)).await;
    let _ = transport.close().await;
    Err(match code {
        code if (30..40).contains(&code) => LimeError::Authorization(description),
        code if (20..30).contains(&code) => LimeError::Protocol(description),
        _ => LimeError::Session(description),
    })
}
