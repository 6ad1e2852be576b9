//! Inbound event dispatch
//!
//! One task per connection consumes the engine's transport events and the
//! liveness ticker. Handlers run one after another; anything that has to wait
//! for a control channel reply is spawned so the loop keeps draining frames.

use super::session::{DataStream, ParkedTrack, Session};
use crate::config::UnknownSyscallPolicy;
use crate::domain::shared::{PauseReason, Result, SessionError};
use crate::domain::transport::{
    ConnectionState, DataChannel, IceCandidate, StreamMessage, TransportEvent,
    TransportEventReceiver,
};
use crate::infrastructure::protocols::rpc::{
    CloseMediaAck, NegotiationAck, PathArgs, Syscall, SyscallMessage, SYSCALL_STREAM,
};
use crate::infrastructure::telemetry;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Mid of the bandwidth probing section; never carries application media
const PROBATOR_MID: &str = "probator";

pub(super) fn spawn(session: Session, mut events: TransportEventReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(session.inner.config.liveness_tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        debug!("Transport event channel closed");
                        break;
                    };
                    trace!("Transport event: {:?}", event);
                    if let Err(e) = session.handle_event(event).await {
                        error!("Failed to handle transport event: {}", e);
                    }
                }
                _ = ticker.tick() => session.on_liveness_tick().await,
            }
        }
    })
}

impl Session {
    async fn handle_event(&self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::DataChannelOpen { label } if label == SYSCALL_STREAM => {
                self.on_control_open().await;
                Ok(())
            }
            TransportEvent::DataChannelOpen { label } => {
                self.on_stream_open(label);
                Ok(())
            }
            TransportEvent::DataChannelMessage { label, message } if label == SYSCALL_STREAM => {
                match message {
                    StreamMessage::Text(text) => self.handle_syscall(&text).await,
                    StreamMessage::Binary(_) => Err(SessionError::Protocol(
                        "binary frame on control channel".to_string(),
                    )),
                }
            }
            TransportEvent::DataChannelMessage { label, message } => {
                self.on_stream_message(&label, &message).await;
                Ok(())
            }
            TransportEvent::DataChannelClose { label } if label == SYSCALL_STREAM => {
                info!("Control channel closed");
                self.inner.rpc.detach().await;
                Ok(())
            }
            TransportEvent::DataChannelClose { label } => {
                self.on_stream_gone(&label, None).await;
                Ok(())
            }
            TransportEvent::DataChannelError { label, error } => {
                warn!("Data channel {} failed: {}", label, error);
                if label != SYSCALL_STREAM {
                    self.on_stream_gone(&label, Some(&error)).await;
                }
                Ok(())
            }
            TransportEvent::RemoteDataChannel { channel } => {
                self.on_remote_stream(channel).await;
                Ok(())
            }
            TransportEvent::TrackAdded {
                mid,
                track,
                transceiver,
                stream_id,
            } => {
                let Some(mid) = mid else {
                    warn!("Remote track {} without mid", track.id());
                    return Ok(());
                };
                if mid == PROBATOR_MID {
                    return Ok(());
                }
                self.on_track_added(ParkedTrack {
                    mid,
                    track,
                    transceiver,
                    stream_id,
                })
                .await;
                Ok(())
            }
            TransportEvent::IceCandidate(candidate) => {
                self.on_ice_candidate(candidate).await;
                Ok(())
            }
            TransportEvent::IceConnectionStateChanged(state) => {
                debug!("ICE connection state: {}", state);
                self.inner.state.lock().await.ice_state = Some(state);
                Ok(())
            }
            TransportEvent::ConnectionStateChanged(state) => {
                self.on_connection_state(state);
                Ok(())
            }
        }
    }

    async fn on_control_open(&self) {
        let state = self.inner.state.lock().await;
        let Some(channel) = state.syscall_channel.clone() else {
            warn!("Control channel opened without a session");
            return;
        };
        self.inner.rpc.attach(channel).await;
        if let Some(ready) = &state.control_ready {
            ready.send_replace(true);
        }
        info!("Control channel ready");
    }

    fn on_connection_state(&self, state: ConnectionState) {
        telemetry::record_connection_state(state.as_str());
        match state {
            ConnectionState::Connected => info!("Session {} connected", self.inner.cname),
            ConnectionState::Disconnected | ConnectionState::Failed => {
                warn!("Session {} {}", self.inner.cname, state.as_str());
                let session = self.clone();
                tokio::spawn(async move { session.teardown(false, true).await });
            }
            other => debug!("Connection state: {}", other.as_str()),
        }
    }

    async fn on_ice_candidate(&self, candidate: Option<IceCandidate>) {
        let mut state = self.inner.state.lock().await;
        match candidate {
            Some(c) if c.sdp_mline_index.unwrap_or(0) == 0 => {
                debug!("Local candidate: {}", c.candidate);
                state.candidates.push(c);
            }
            Some(_) => {}
            None => state.candidates_complete = true,
        }
    }

    /// Bind a remote track, or park it until its mid is mapped
    async fn on_track_added(&self, parked: ParkedTrack) {
        let vetoed = {
            let mut state = self.inner.state.lock().await;
            match state.mid_path_map.get(&parked.mid).cloned() {
                Some(path) => state.attach_remote_track(&path, parked),
                None => {
                    debug!("Parking remote track for unmapped mid {}", parked.mid);
                    state.parked.push(parked);
                    None
                }
            }
        };
        self.close_vetoed(vetoed.into_iter().collect());
    }

    async fn handle_syscall(&self, text: &str) -> Result<()> {
        let frame = SyscallMessage::parse(text)?;
        if Syscall::is_verbose(&frame.function) {
            trace!("syscall <- {}", text);
        } else {
            debug!("syscall <- {}", text);
        }
        if frame.is_notification() {
            return self.handle_notification(&frame).await;
        }

        let msgid = frame.msgid.unwrap_or_default();
        let Some(waiter) = self.inner.rpc.take_pending(msgid).await else {
            debug!("No pending call for msgid {} ({})", msgid, frame.function);
            return Ok(());
        };
        let result = self.response_result(&frame).await;
        if waiter.send(result).is_err() {
            debug!("Caller of msgid {} went away", msgid);
        }
        Ok(())
    }

    async fn handle_notification(&self, frame: &SyscallMessage) -> Result<()> {
        match Syscall::classify(&frame.function) {
            Syscall::Close => {
                info!("Session {} closed by remote peer", self.inner.cname);
                let session = self.clone();
                tokio::spawn(async move { session.teardown(false, true).await });
                Ok(())
            }
            Syscall::CloseTrack => {
                let path = required_path(frame)?;
                if !self.inner.state.lock().await.close_track(path, false).await {
                    debug!("close_track for unknown track {}", path);
                }
                Ok(())
            }
            Syscall::RemotePause => self.remote_pause(required_path(frame)?, true).await,
            Syscall::RemoteResume => self.remote_pause(required_path(frame)?, false).await,
            Syscall::Ping => {
                self.keep_alive(frame.path()).await;
                Ok(())
            }
            Syscall::Consume | Syscall::Produce => Err(unsupported(&frame.function)),
            Syscall::ConsumeAck
            | Syscall::ProduceAck
            | Syscall::CloseMediaAck
            | Syscall::Ack => {
                debug!("Ignoring {} without msgid", frame.function);
                Ok(())
            }
            Syscall::Unknown => match self.inner.config.unknown_syscall {
                UnknownSyscallPolicy::Abort => Err(SessionError::Protocol(format!(
                    "unknown syscall: {}",
                    frame.function
                ))),
                UnknownSyscallPolicy::Ignore => {
                    warn!("Ignoring unknown syscall {}", frame.function);
                    Ok(())
                }
            },
        }
    }

    /// Outcome handed to the caller waiting on a response frame
    async fn response_result(&self, frame: &SyscallMessage) -> Result<Value> {
        if let Some(message) = frame.error() {
            return Err(SessionError::Rpc {
                function: frame
                    .function
                    .strip_suffix("_ack")
                    .unwrap_or(&frame.function)
                    .to_string(),
                message,
            });
        }
        match Syscall::classify(&frame.function) {
            Syscall::ConsumeAck | Syscall::ProduceAck => self.accept_negotiation_ack(frame).await,
            Syscall::CloseMediaAck => self.accept_close_media_ack(frame).await,
            Syscall::Consume | Syscall::Produce => Err(unsupported(&frame.function)),
            _ => Ok(frame.args().clone()),
        }
    }

    /// Apply status and mid mapping of a consume/produce ack
    async fn accept_negotiation_ack(&self, frame: &SyscallMessage) -> Result<Value> {
        let ack: NegotiationAck = frame.decode_args()?;
        if ack.sdp.is_none() {
            return Err(SessionError::Negotiation(format!(
                "invalid response: no sdp in {}",
                frame.function
            )));
        }

        let vetoed = {
            let mut state = self.inner.state.lock().await;
            for (path, status) in &ack.status_map {
                let reasons: Vec<_> = status
                    .paused_reasons
                    .iter()
                    .filter_map(|r| PauseReason::from_str_opt(r))
                    .collect();
                if let Some(track) = state.track_mut(path) {
                    for reason in &reasons {
                        track.pause(*reason, true);
                    }
                } else if let Some(media) = state.medias.get_mut(path.as_str()) {
                    for track in media.tracks_mut() {
                        for reason in &reasons {
                            track.pause(*reason, true);
                        }
                    }
                } else {
                    debug!("No track for status of {}", path);
                }
            }
            state.merge_mid_path_map(ack.mid_media_path_map)
        };
        self.close_vetoed(vetoed);
        Ok(frame.args().clone())
    }

    async fn accept_close_media_ack(&self, frame: &SyscallMessage) -> Result<Value> {
        let ack: CloseMediaAck = frame.decode_args()?;
        let mut state = self.inner.state.lock().await;
        for path in &ack.paths {
            state.close_track(path, false).await;
        }
        Ok(frame.args().clone())
    }

    /// `remote_pause` / `remote_resume` on a track path, or on every track of a media path
    async fn remote_pause(&self, path: &str, pause: bool) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if let Some(track) = state.track_mut(path) {
            if pause {
                track.pause(PauseReason::RemoteOp, false);
            } else {
                track.resume(PauseReason::RemoteOp, false);
            }
            return Ok(());
        }
        let media = state
            .medias
            .get_mut(path)
            .ok_or_else(|| SessionError::Resource(format!("no such track: {}", path)))?;
        if pause {
            media.pause(PauseReason::RemoteOp, self.inner.config.track_reconnect_wait());
        } else {
            media.resume(PauseReason::RemoteOp);
        }
        Ok(())
    }

    async fn keep_alive(&self, path: Option<&str>) {
        let mut state = self.inner.state.lock().await;
        match path {
            Some(path) => match state.media_for_mut(path) {
                Some(media) => media.keep_alive(),
                None => trace!("ping for unknown path {}", path),
            },
            None => {
                for media in state.medias.values_mut().filter(|m| m.is_receiver()) {
                    media.keep_alive();
                }
            }
        }
    }

    async fn on_liveness_tick(&self) {
        let report = {
            let mut state = self.inner.state.lock().await;
            if !state.negotiated {
                return;
            }
            self.inner
                .liveness
                .check(state.medias.values_mut(), Instant::now())
        };

        for (path, options) in report.reconnects {
            let session = self.clone();
            tokio::spawn(async move { session.resubscribe(path, options).await });
        }
        if report.ping {
            let session = self.clone();
            tokio::spawn(async move {
                if let Err(e) = session.inner.rpc.call("ping", json!({})).await {
                    debug!("ping failed: {}", e);
                }
            });
        }
    }

    fn on_stream_open(&self, label: String) {
        let session = self.clone();
        tokio::spawn(async move { session.finish_stream_open(label).await });
    }

    /// Announce a published stream, then let the application accept it
    async fn finish_stream_open(&self, label: String) {
        let Some(handler) = self
            .inner
            .state
            .lock()
            .await
            .streams
            .get(&label)
            .map(|s| s.handler.clone())
        else {
            debug!("Stream {} opened after close", label);
            return;
        };
        if handler.publish {
            if let Err(e) = self
                .inner
                .rpc
                .call("publish_stream", PathArgs::new(label.as_str()))
                .await
            {
                warn!("Failed to publish stream {}: {}", label, e);
                if let Some(f) = &handler.on_error {
                    f(&label, &e.to_string());
                }
                return;
            }
        }
        let accepted = handler.on_open.as_ref().map_or(true, |f| f(&label));
        if !accepted {
            info!("Stream {} rejected by application", label);
            if let Err(e) = self.close_stream(&label).await {
                debug!("Failed to close stream {}: {}", label, e);
            }
        } else {
            info!("Stream {} open", label);
        }
    }

    async fn on_stream_message(&self, label: &str, message: &StreamMessage) {
        let handler = self
            .inner
            .state
            .lock()
            .await
            .streams
            .get(label)
            .and_then(|s| s.handler.on_message.clone());
        match handler {
            Some(f) => f(label, message),
            None => debug!("Message on unknown stream {}", label),
        }
    }

    /// Drop a stream the engine closed or failed
    async fn on_stream_gone(&self, label: &str, error: Option<&str>) {
        let Some(stream) = self.inner.state.lock().await.streams.remove(label) else {
            return;
        };
        match error {
            Some(error) => {
                if let Some(f) = &stream.handler.on_error {
                    f(label, error);
                }
            }
            None => {
                if let Some(f) = &stream.handler.on_close {
                    f(label);
                }
            }
        }
    }

    /// Route a channel opened by the remote peer through the session `on_stream` callback
    async fn on_remote_stream(&self, channel: Arc<dyn DataChannel>) {
        let label = channel.label();
        let handler = self
            .inner
            .handler
            .on_stream
            .as_ref()
            .and_then(|f| f(&label))
            .filter(|h| match h.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!("Invalid handler for remote stream {}: {}", label, e);
                    false
                }
            });
        let Some(handler) = handler else {
            info!("Refusing remote stream {}", label);
            if let Err(e) = channel.close().await {
                debug!("Failed to close remote stream {}: {}", label, e);
            }
            return;
        };
        debug!("Accepted remote stream {}", label);
        self.inner.state.lock().await.streams.insert(
            label,
            DataStream {
                channel,
                handler,
                remote: true,
            },
        );
    }
}

fn required_path(frame: &SyscallMessage) -> Result<&str> {
    frame
        .path()
        .ok_or_else(|| SessionError::Protocol(format!("{} without path", frame.function)))
}

fn unsupported(function: &str) -> SessionError {
    SessionError::Protocol(format!("{} from the remote peer is not supported", function))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_path() {
        let frame = SyscallMessage::parse(r#"{"fn":"remote_pause","args":{"path":"a/cam/video"}}"#)
            .unwrap();
        assert_eq!(required_path(&frame).unwrap(), "a/cam/video");
        let bare = SyscallMessage::parse(r#"{"fn":"close_track"}"#).unwrap();
        assert!(matches!(
            required_path(&bare),
            Err(SessionError::Protocol(_))
        ));
    }

    #[test]
    fn test_unsupported_requests() {
        let e = unsupported("consume");
        assert_eq!(e.kind(), "protocol");
        assert!(e.to_string().contains("consume"));
    }
}
