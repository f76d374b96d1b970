//! Handles the real-time WebSocket connection to an ElevenLabs agent.

use crate::protocol::{
    AgentOverride, ClientEvent, ConversationConfigOverride, PromptOverride, ServerEvent,
    TtsOverride, UserAudioChunk,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use fourthwall_core::{
    audio_utils,
    error::SessionError,
    voice::{
        AgentEvent, AgentMode, AgentSession, EventSink, MessageSource, MicTap, SessionConfig,
        VoiceAgent,
    },
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use secrecy::{ExposeSecret, SecretString};
use std::{sync::Arc, time::Duration};
use tokio::{
    net::TcpStream,
    sync::{broadcast, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{Instrument, debug, error, info, warn};
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "wss://api.elevenlabs.io/v1/convai/conversation";

/// How often the pump checks whether agent playback has drained.
const PLAYBACK_POLL: Duration = Duration::from_millis(100);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

/// Where agent speech goes. Implementations must not block.
pub trait AudioOutput: Send + Sync {
    /// Queues 16 kHz mono PCM16 for playback.
    fn play(&self, pcm16: &[i16]);
    /// Drops anything still queued; the user interrupted the agent.
    fn interrupt(&self);
    fn is_playing(&self) -> bool;
}

/// Discards agent audio.
pub struct NullOutput;

impl AudioOutput for NullOutput {
    fn play(&self, _pcm16: &[i16]) {}
    fn interrupt(&self) {}
    fn is_playing(&self) -> bool {
        false
    }
}

/// `VoiceAgent` backed by the ElevenLabs Conversational AI WebSocket.
pub struct ElevenLabsAgent {
    endpoint: String,
    api_key: Option<SecretString>,
    output: Arc<dyn AudioOutput>,
}

impl ElevenLabsAgent {
    pub fn new(api_key: Option<SecretString>, output: Arc<dyn AudioOutput>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key,
            output,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn connect(&self, config: &SessionConfig) -> Result<WsStream> {
        let url = conversation_url(&self.endpoint, &config.agent_id)?;
        let mut request = url.as_str().into_client_request()?;
        if let Some(key) = &self.api_key {
            request
                .headers_mut()
                .insert("xi-api-key", key.expose_secret().parse()?);
        }
        let (ws_stream, _) = connect_async(request)
            .await
            .context("Failed to connect to ElevenLabs Conversational AI WebSocket")?;
        Ok(ws_stream)
    }
}

/// The conversation URL for `agent_id`, with the id form-encoded into the query.
pub fn conversation_url(endpoint: &str, agent_id: &str) -> Result<Url> {
    let mut url =
        Url::parse(endpoint).with_context(|| format!("Invalid agent endpoint: {endpoint}"))?;
    url.query_pairs_mut().append_pair("agent_id", agent_id);
    Ok(url)
}

fn initiation_event(config: &SessionConfig) -> ClientEvent {
    ClientEvent::ConversationInitiationClientData {
        conversation_config_override: ConversationConfigOverride {
            agent: AgentOverride {
                prompt: PromptOverride {
                    prompt: config.prompt.clone(),
                },
                first_message: config.first_message.clone(),
            },
            tts: TtsOverride {
                voice_id: config.voice_id.clone(),
            },
        },
    }
}

async fn send_json<T: serde::Serialize>(sink: &mut WsSink, msg: &T) -> Result<()> {
    let serialized = serde_json::to_string(msg)?;
    sink.send(WsMessage::Text(serialized)).await?;
    Ok(())
}

#[async_trait]
impl VoiceAgent for ElevenLabsAgent {
    async fn open(
        &self,
        config: SessionConfig,
        mic: Arc<dyn MicTap>,
        events: EventSink,
    ) -> Result<Box<dyn AgentSession>, SessionError> {
        let ws_stream = self
            .connect(&config)
            .await
            .map_err(|e| SessionError::Open(format!("{e:#}")))?;
        let (mut ws_tx, ws_rx) = ws_stream.split();

        send_json(&mut ws_tx, &initiation_event(&config))
            .await
            .map_err(|e| SessionError::Open(format!("{e:#}")))?;
        info!(character = %config.character_name, "Connected to ElevenLabs; awaiting conversation metadata.");

        let (close_tx, close_rx) = oneshot::channel();
        let pump = Pump {
            ws_tx,
            ws_rx,
            mic: mic.subscribe(),
            events: events.clone(),
            output: self.output.clone(),
            speaking: false,
        };
        let span = tracing::info_span!("elevenlabs_session", generation = events.generation());
        let handle = tokio::spawn(pump.run(close_rx).instrument(span));

        Ok(Box::new(ElevenLabsSession {
            close_tx,
            handle,
            events,
        }))
    }
}

/// Why the pump stopped.
#[derive(Debug, PartialEq)]
enum PumpExit {
    Requested,
    Remote,
}

struct ElevenLabsSession {
    close_tx: oneshot::Sender<()>,
    handle: JoinHandle<PumpExit>,
    events: EventSink,
}

#[async_trait]
impl AgentSession for ElevenLabsSession {
    async fn close(self: Box<Self>) -> Result<(), SessionError> {
        let ElevenLabsSession {
            close_tx,
            handle,
            events,
        } = *self;
        // The pump may already be gone if the agent hung up first.
        let _ = close_tx.send(());
        match handle.await {
            Ok(PumpExit::Requested) => {
                events.emit(AgentEvent::Disconnected);
                Ok(())
            }
            Ok(PumpExit::Remote) => Ok(()),
            Err(e) => Err(SessionError::Close(e.to_string())),
        }
    }
}

/// Moves microphone audio to the agent and agent events to the controller.
struct Pump {
    ws_tx: WsSink,
    ws_rx: SplitStream<WsStream>,
    mic: broadcast::Receiver<Arc<[i16]>>,
    events: EventSink,
    output: Arc<dyn AudioOutput>,
    speaking: bool,
}

impl Pump {
    async fn run(mut self, mut close_rx: oneshot::Receiver<()>) -> PumpExit {
        let mut mic_open = true;
        let mut playback = tokio::time::interval(PLAYBACK_POLL);

        loop {
            tokio::select! {
                biased;
                _ = &mut close_rx => {
                    if let Err(e) = self.ws_tx.send(WsMessage::Close(None)).await {
                        debug!(error = %e, "Close frame could not be sent.");
                    }
                    self.output.interrupt();
                    info!("ElevenLabs session closed on request.");
                    return PumpExit::Requested;
                }
                msg = self.ws_rx.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Err(e) = self.handle_server_text(&text).await {
                                error!(error = ?e, "Failed to answer ElevenLabs event.");
                                self.events.emit(AgentEvent::Error(format!("{e:#}")));
                                return PumpExit::Remote;
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            info!(?frame, "ElevenLabs closed the conversation.");
                            self.output.interrupt();
                            self.events.emit(AgentEvent::Disconnected);
                            return PumpExit::Remote;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "ElevenLabs WebSocket failed.");
                            self.events.emit(AgentEvent::Error(e.to_string()));
                            return PumpExit::Remote;
                        }
                        None => {
                            self.events.emit(AgentEvent::Disconnected);
                            return PumpExit::Remote;
                        }
                    }
                }
                chunk = self.mic.recv(), if mic_open => {
                    match chunk {
                        Ok(pcm) => {
                            let msg = UserAudioChunk { user_audio_chunk: audio_utils::encode_i16(&pcm) };
                            if let Err(e) = send_json(&mut self.ws_tx, &msg).await {
                                self.events.emit(AgentEvent::Error(format!("{e:#}")));
                                return PumpExit::Remote;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Dropped microphone chunks.");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("Microphone stream ended.");
                            mic_open = false;
                        }
                    }
                }
                _ = playback.tick() => {
                    if self.speaking && !self.output.is_playing() {
                        self.set_speaking(false);
                    }
                }
            }
        }
    }

    fn set_speaking(&mut self, speaking: bool) {
        if self.speaking != speaking {
            self.speaking = speaking;
            let mode = if speaking {
                AgentMode::Speaking
            } else {
                AgentMode::Listening
            };
            self.events.emit(AgentEvent::ModeChange(mode));
        }
    }

    async fn handle_server_text(&mut self, text: &str) -> Result<()> {
        let event = match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "Ignoring unparseable ElevenLabs message.");
                return Ok(());
            }
        };
        match event {
            ServerEvent::ConversationInitiationMetadata {
                conversation_initiation_metadata_event: meta,
            } => {
                info!(conversation_id = %meta.conversation_id, format = ?meta.agent_output_audio_format, "Conversation started.");
                self.events.emit(AgentEvent::Connected);
            }
            ServerEvent::Audio { audio_event } => {
                self.set_speaking(true);
                self.output
                    .play(&audio_utils::decode_i16(&audio_event.audio_base_64));
            }
            ServerEvent::AgentResponse {
                agent_response_event,
            } => {
                self.events.emit(AgentEvent::Message {
                    source: MessageSource::Agent,
                    message: agent_response_event.agent_response,
                });
            }
            ServerEvent::UserTranscript {
                user_transcription_event,
            } => {
                self.set_speaking(false);
                self.events.emit(AgentEvent::Message {
                    source: MessageSource::User,
                    message: user_transcription_event.user_transcript,
                });
            }
            ServerEvent::Interruption {} => {
                self.output.interrupt();
                self.set_speaking(false);
            }
            ServerEvent::Ping { ping_event } => {
                send_json(
                    &mut self.ws_tx,
                    &ClientEvent::Pong {
                        event_id: ping_event.event_id,
                    },
                )
                .await?;
            }
            ServerEvent::Unknown => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use tokio::{net::TcpListener, sync::mpsc};
    use tokio_tungstenite::accept_async;

    struct TestTap {
        tx: broadcast::Sender<Arc<[i16]>>,
    }

    impl MicTap for TestTap {
        fn level(&self) -> f32 {
            0.0
        }
        fn subscribe(&self) -> broadcast::Receiver<Arc<[i16]>> {
            self.tx.subscribe()
        }
    }

    #[derive(Default)]
    struct RecordingOutput {
        played: Mutex<Vec<i16>>,
    }

    impl AudioOutput for RecordingOutput {
        fn play(&self, pcm16: &[i16]) {
            self.played.lock().unwrap().extend_from_slice(pcm16);
        }
        fn interrupt(&self) {}
        fn is_playing(&self) -> bool {
            true
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            agent_id: "agent-1".into(),
            voice_id: "goT3UYdM9bhm0n2lmKQx".into(),
            prompt: "You are Captain Ahab.".into(),
            first_message: None,
            character_name: "Captain Ahab".into(),
        }
    }

    /// A scripted stand-in for the ElevenLabs endpoint. Reports every client
    /// message it receives.
    async fn fake_agent_server() -> (String, mpsc::UnboundedReceiver<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            let scripted = [
                json!({"type": "conversation_initiation_metadata",
                       "conversation_initiation_metadata_event": {"conversation_id": "c1", "agent_output_audio_format": "pcm_16000"}}),
                json!({"type": "audio", "audio_event": {"audio_base_64": audio_utils::encode_i16(&[1, 2, 3]), "event_id": 1}}),
                json!({"type": "agent_response", "agent_response_event": {"agent_response": "Call me Ahab."}}),
                json!({"type": "ping", "ping_event": {"event_id": 42, "ping_ms": null}}),
            ];

            let first = ws.next().await.unwrap().unwrap();
            let _ = seen_tx.send(serde_json::from_str(first.to_text().unwrap()).unwrap());
            for msg in scripted {
                ws.send(WsMessage::Text(msg.to_string())).await.unwrap();
            }
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    WsMessage::Text(text) => {
                        let _ = seen_tx.send(serde_json::from_str(&text).unwrap());
                    }
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
        });

        (format!("ws://{addr}"), seen_rx)
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let (endpoint, mut seen) = fake_agent_server().await;
        let output = Arc::new(RecordingOutput::default());
        let agent = ElevenLabsAgent::new(None, output.clone()).with_endpoint(endpoint);
        let (mic_tx, _) = broadcast::channel(8);
        let tap = Arc::new(TestTap { tx: mic_tx.clone() });
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let session = agent
            .open(config(), tap, EventSink::new(3, events_tx))
            .await
            .unwrap();

        let init = seen.recv().await.unwrap();
        assert_eq!(init["type"], "conversation_initiation_client_data");
        assert_eq!(
            init["conversation_config_override"]["tts"]["voice_id"],
            "goT3UYdM9bhm0n2lmKQx"
        );

        let mut received = Vec::new();
        while received.len() < 3 {
            let (generation, event) = events_rx.recv().await.unwrap();
            assert_eq!(generation, 3);
            received.push(event);
        }
        assert_eq!(
            received,
            vec![
                AgentEvent::Connected,
                AgentEvent::ModeChange(AgentMode::Speaking),
                AgentEvent::Message {
                    source: MessageSource::Agent,
                    message: "Call me Ahab.".into()
                },
            ]
        );
        assert_eq!(output.played.lock().unwrap().as_slice(), &[1, 2, 3]);

        let pong = seen.recv().await.unwrap();
        assert_eq!(pong, json!({"type": "pong", "event_id": 42}));

        mic_tx.send(Arc::from(vec![7i16, 8])).unwrap();
        let chunk = seen.recv().await.unwrap();
        assert_eq!(chunk["user_audio_chunk"], audio_utils::encode_i16(&[7, 8]));

        session.close().await.unwrap();
        let mut saw_disconnect = false;
        while let Ok((_, event)) = events_rx.try_recv() {
            saw_disconnect |= event == AgentEvent::Disconnected;
        }
        assert!(saw_disconnect);
    }

    #[test]
    fn test_conversation_url_encodes_agent_id() {
        let url = conversation_url(DEFAULT_ENDPOINT, "agent_1").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://api.elevenlabs.io/v1/convai/conversation?agent_id=agent_1"
        );

        let url = conversation_url("ws://127.0.0.1:9", "a b&c").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:9/?agent_id=a+b%26c");

        assert!(conversation_url("not a url", "agent_1").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_to_open() {
        let agent =
            ElevenLabsAgent::new(None, Arc::new(NullOutput)).with_endpoint("ws://127.0.0.1:1");
        let (mic_tx, _) = broadcast::channel(1);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        let result = agent
            .open(
                config(),
                Arc::new(TestTap { tx: mic_tx }),
                EventSink::new(1, events_tx),
            )
            .await;

        assert!(matches!(result, Err(SessionError::Open(_))));
    }
}
