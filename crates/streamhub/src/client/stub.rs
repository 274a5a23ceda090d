use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use streamhub_core::{
    DisconnectReason, FrameHead, HandshakeError, MessagePackSerializer, MethodDescriptor,
    PayloadSerializer, RpcError, Transport,
};

use super::{ClientSession, ReceiverTable, SessionState};
use crate::config::ClientOptions;

/// Typed client for one hub.
///
/// Every method goes through the same generic path: the descriptor supplies
/// the wire id, `A` is the packed argument type and `R` the result type.
///
/// ```ignore
/// const ADD: MethodDescriptor = MethodDescriptor::new("Add");
/// let sum: i32 = client.invoke(ADD, &(2, 3)).await?;
/// ```
#[derive(Debug)]
pub struct HubClient<S = MessagePackSerializer> {
    session: ClientSession,
    _serializer: PhantomData<fn() -> S>,
}

impl<S: PayloadSerializer> HubClient<S> {
    pub async fn connect(
        hub_name: &str,
        transport: Transport,
        receivers: ReceiverTable<S>,
        options: ClientOptions,
    ) -> Result<Self, HandshakeError> {
        let session = ClientSession::connect(hub_name, transport, receivers, options).await?;
        Ok(Self {
            session,
            _serializer: PhantomData,
        })
    }

    /// Call `method` and wait for its result.
    pub async fn invoke<A, R>(&self, method: MethodDescriptor, args: &A) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = self
            .session
            .request_with_response(method.id, |call_id, pool| {
                FrameHead::RequestWithResponse {
                    call_id,
                    method_id: method.id,
                }
                .encode::<S, A>(pool, args)
            })
            .await?;
        S::deserialize(&payload).map_err(RpcError::from)
    }

    /// Call `method` without waiting for (or receiving) a result.
    pub fn invoke_no_reply<A>(&self, method: MethodDescriptor, args: &A) -> Result<(), RpcError>
    where
        A: Serialize + ?Sized,
    {
        let frame = FrameHead::Request {
            method_id: method.id,
        }
        .encode::<S, A>(self.session.buffer_pool(), args)?;
        self.session.send(frame)
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub async fn dispose(&self) -> DisconnectReason {
        self.session.dispose().await
    }

    pub async fn wait_for_disconnect(&self) -> DisconnectReason {
        self.session.wait_for_disconnect().await
    }
}
