use std::sync::Arc;

use crate::channel::{Channel, ClientStreaming, ServerStreaming};
use crate::encrypt::Encrypter;
use crate::error::WireError;
use crate::message::*;
use crate::tls::ClientTls;

/// Typed master-side handle to a worker.
#[derive(Clone)]
pub struct WorkerClient {
  channel: Channel,
}

impl WorkerClient {
  pub fn new(channel: Channel) -> Self {
    Self { channel }
  }

  pub async fn dial(
    address: &str,
    tls: Option<&ClientTls>,
    encrypter: Option<Arc<dyn Encrypter>>,
  ) -> Result<Self, WireError> {
    Channel::dial(address, tls, encrypter).await.map(Self::new)
  }

  pub fn channel(&self) -> &Channel {
    &self.channel
  }

  pub async fn connect(&self, request: ConnectRequest) -> Result<ConnectResponse, WireError> {
    self.channel.unary(Method::Connect, &request).await
  }

  pub async fn disconnect(&self, request: DisconnectRequest) -> Result<Ack, WireError> {
    self.channel.unary(Method::Disconnect, &request).await
  }

  pub async fn slave_command(
    &self,
    request: SlaveCommandRequest,
  ) -> Result<SlaveCommandResponse, WireError> {
    self.channel.unary(Method::SlaveCommand, &request).await
  }

  pub fn slave_command_default_store(
    &self,
  ) -> Result<ClientStreaming<SlaveCommandDefaultStoreRequest, Ack>, WireError> {
    self
      .channel
      .client_streaming(Method::SlaveCommandDefaultStore)
  }

  pub fn call_exec(
    &self,
    request: CallExecRequest,
  ) -> Result<ServerStreaming<CallExecResponse>, WireError> {
    self.channel.server_streaming(Method::CallExec, &request)
  }

  pub fn receive_chanel_connect(
    &self,
    request: ReceiveChanelConnectRequest,
  ) -> Result<ServerStreaming<ReceiveChanelConnectResponse>, WireError> {
    self
      .channel
      .server_streaming(Method::ReceiveChanelConnect, &request)
  }

  pub fn send_loader(&self) -> Result<ClientStreaming<SendLoaderRequest, Ack>, WireError> {
    self.channel.client_streaming(Method::SendLoader)
  }

  pub async fn send_auth(&self, request: SendAuthRequest) -> Result<Ack, WireError> {
    self.channel.unary(Method::SendAuth, &request).await
  }

  pub fn send_store_data(&self) -> Result<ClientStreaming<SendStoreDataRequest, Ack>, WireError> {
    self.channel.client_streaming(Method::SendStoreData)
  }

  pub async fn send_store_ok(&self, request: SendStoreOkRequest) -> Result<Ack, WireError> {
    self.channel.unary(Method::SendStoreOk, &request).await
  }

  pub async fn send_target(&self, request: SendTargetRequest) -> Result<Ack, WireError> {
    self.channel.unary(Method::SendTarget, &request).await
  }

  pub async fn receive_load_term_channel(
    &self,
    request: ReceiveLoadTermChannelRequest,
  ) -> Result<ReceiveLoadTermChannelResponse, WireError> {
    self
      .channel
      .unary(Method::ReceiveLoadTermChannel, &request)
      .await
  }

  pub fn close(&self) {
    self.channel.close();
  }
}
