use std::sync::Mutex;
use tracing::debug;

/// Audio and speech output. Calls are fire-and-forget.
pub trait SoundEffects: Send + Sync {
    fn play(&self, url: &str, looped: bool);
    fn stop(&self);
    fn speak(&self, text: &str);
    fn stop_speaking(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSoundEffects;

impl SoundEffects for NoopSoundEffects {
    fn play(&self, url: &str, looped: bool) {
        debug!(url, looped, "play");
    }

    fn stop(&self) {
        debug!("stop playback");
    }

    fn speak(&self, text: &str) {
        debug!(text, "speak");
    }

    fn stop_speaking(&self) {
        debug!("stop speaking");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectCall {
    Play { url: String, looped: bool },
    Stop,
    Speak(String),
    StopSpeaking,
}

#[derive(Debug, Default)]
pub struct RecordingSoundEffects {
    calls: Mutex<Vec<EffectCall>>,
}

impl RecordingSoundEffects {
    pub fn calls(&self) -> Vec<EffectCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn record(&self, call: EffectCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl SoundEffects for RecordingSoundEffects {
    fn play(&self, url: &str, looped: bool) {
        self.record(EffectCall::Play {
            url: url.to_string(),
            looped,
        });
    }

    fn stop(&self) {
        self.record(EffectCall::Stop);
    }

    fn speak(&self, text: &str) {
        self.record(EffectCall::Speak(text.to_string()));
    }

    fn stop_speaking(&self) {
        self.record(EffectCall::StopSpeaking);
    }
}
