//! Requests to the light sensor, door sensor and lamp relay nodes.
//!
//! Failures never propagate past this module: a failed read is an unknown
//! reading and a failed write is `false`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use anyhow::{Context as _, anyhow, bail};
use coap_lite::{CoapRequest, MessageClass, MessageType, Packet, RequestType, ResponseType};
use log::{debug, warn};
use tokio::net::UdpSocket;

use crate::config::EndpointsConfig;
use crate::messages::{Daylight, DoorReading, LightState, ThresholdKind};

const DAYLIGHT_RESOURCE: &str = "lightsensor/daylight";
const DOOR_RESOURCE: &str = "door/state";
const LAMP_RESOURCE: &str = "lamp/state";

/// Largest datagram the sensor nodes send.
const MAX_DATAGRAM: usize = 1152;

pub trait SensorClient: Send + Sync {
    fn daylight(&self) -> impl Future<Output = Daylight> + Send;

    fn threshold(&self, kind: ThresholdKind) -> impl Future<Output = Option<String>> + Send;

    fn set_threshold(&self, kind: ThresholdKind, value: &str)
    -> impl Future<Output = bool> + Send;

    fn door(&self) -> impl Future<Output = DoorReading> + Send;

    fn set_lamp(&self, state: LightState) -> impl Future<Output = bool> + Send;
}

#[derive(Debug)]
pub struct CoapClient {
    light_sensor: SocketAddr,
    lamp: SocketAddr,
    door: SocketAddr,
    timeout: Duration,
    next_id: AtomicU16,
}

impl CoapClient {
    pub fn new(config: &EndpointsConfig) -> Self {
        // Start message ids somewhere arbitrary so restarts do not reuse them.
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u16)
            .unwrap_or_default();
        CoapClient {
            light_sensor: config.light_sensor(),
            lamp: config.lamp(),
            door: config.door(),
            timeout: config.request_timeout(),
            next_id: AtomicU16::new(seed),
        }
    }

    async fn get(&self, endpoint: SocketAddr, path: &str) -> Option<String> {
        match self.request(endpoint, RequestType::Get, path, b"").await {
            Ok(payload) => Some(payload),
            Err(err) => {
                warn!("GET coap://{}/{} failed: {:#}", endpoint, path, err);
                None
            }
        }
    }

    async fn post(&self, endpoint: SocketAddr, path: &str, payload: &str) -> bool {
        match self.request(endpoint, RequestType::Post, path, payload.as_bytes()).await {
            Ok(_) => true,
            Err(err) => {
                warn!("POST coap://{}/{} failed: {:#}", endpoint, path, err);
                false
            }
        }
    }

    async fn request(
        &self,
        endpoint: SocketAddr,
        method: RequestType,
        path: &str,
        payload: &[u8],
    ) -> anyhow::Result<String> {
        tokio::time::timeout(self.timeout, self.exchange(endpoint, method, path, payload))
            .await
            .with_context(|| format!("no response within {:?}", self.timeout))?
    }

    async fn exchange(
        &self,
        endpoint: SocketAddr,
        method: RequestType,
        path: &str,
        payload: &[u8],
    ) -> anyhow::Result<String> {
        let bind: SocketAddr = if endpoint.is_ipv6() {
            "[::]:0".parse()?
        } else {
            "0.0.0.0:0".parse()?
        };
        let socket = UdpSocket::bind(bind).await.context("binding UDP socket")?;
        socket.connect(endpoint).await.context("connecting UDP socket")?;

        let message_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = message_id.to_be_bytes().to_vec();
        debug!("Request {:?} coap://{}/{}", method, endpoint, path);
        let mut request: CoapRequest<SocketAddr> = CoapRequest::new();
        request.message.header.set_type(MessageType::Confirmable);
        request.message.header.message_id = message_id;
        request.message.set_token(token.clone());
        request.set_method(method);
        request.set_path(path);
        request.message.payload = payload.to_vec();

        let bytes = request
            .message
            .to_bytes()
            .map_err(|err| anyhow!("encoding request: {:?}", err))?;
        socket.send(&bytes).await.context("sending request")?;

        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let len = socket.recv(&mut buf).await.context("receiving response")?;
            let response = match Packet::from_bytes(&buf[..len]) {
                Ok(response) => response,
                Err(err) => {
                    debug!("Ignoring undecodable datagram from {}: {:?}", endpoint, err);
                    continue;
                }
            };

            let kind = response.header.get_type();
            if kind == MessageType::Reset && response.header.message_id == message_id {
                bail!("request reset by peer");
            }
            // Empty ACK: the real response follows separately.
            if kind == MessageType::Acknowledgement && response.header.code == MessageClass::Empty {
                continue;
            }
            if response.get_token().to_vec() != token {
                continue;
            }
            if kind == MessageType::Confirmable {
                socket.send(&empty_ack(response.header.message_id)?).await?;
            }
            if !is_success(&response.header.code) {
                bail!("response code {:?}", response.header.code);
            }
            return Ok(String::from_utf8_lossy(&response.payload).into_owned());
        }
    }
}

fn empty_ack(message_id: u16) -> anyhow::Result<Vec<u8>> {
    let mut ack = Packet::new();
    ack.header.set_type(MessageType::Acknowledgement);
    ack.header.message_id = message_id;
    ack.header.code = MessageClass::Empty;
    ack.to_bytes()
        .map_err(|err| anyhow!("encoding ACK: {:?}", err))
}

/// Any 2.xx response.
fn is_success(code: &MessageClass) -> bool {
    matches!(
        code,
        MessageClass::Response(
            ResponseType::Created
                | ResponseType::Deleted
                | ResponseType::Valid
                | ResponseType::Changed
                | ResponseType::Content
                | ResponseType::Continue
        )
    )
}

impl SensorClient for CoapClient {
    async fn daylight(&self) -> Daylight {
        Daylight::from_payload(self.get(self.light_sensor, DAYLIGHT_RESOURCE).await.as_deref())
    }

    async fn threshold(&self, kind: ThresholdKind) -> Option<String> {
        self.get(self.light_sensor, kind.resource()).await
    }

    async fn set_threshold(&self, kind: ThresholdKind, value: &str) -> bool {
        self.post(self.light_sensor, kind.resource(), value).await
    }

    async fn door(&self) -> DoorReading {
        DoorReading::from_payload(self.get(self.door, DOOR_RESOURCE).await.as_deref())
    }

    async fn set_lamp(&self, state: LightState) -> bool {
        self.post(self.lamp, LAMP_RESOURCE, state.payload()).await
    }
}
