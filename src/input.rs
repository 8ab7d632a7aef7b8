//! Stdin input dispatcher: publishes single keys on a
//! bounded channel, with an MFA-digit sub-mode that redirects input to an
//! internal buffer and forwards the collected code elsewhere.
//!
//! Generic over `Read` so its body can be driven by a `Cursor` in tests
//! instead of real stdin.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

/// A key published to the coordinator, or an MFA code collected and
/// forwarded to the credential provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Enter,
    Backspace,
}

/// Shared flag the credential provider toggles to request MFA sub-mode.
#[derive(Clone, Default)]
pub struct MfaPromptFlag(Arc<AtomicBool>);

impl MfaPromptFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self, prompting: bool) {
        self.0.store(prompting, Ordering::Relaxed);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Reads raw bytes from `source` and either publishes them as `Key`
/// events on `keys`, or — while `mfa_prompting` is set — accumulates
/// digits into an internal buffer and forwards the completed code on
/// `mfa_codes`.
pub struct InputDispatcher<R> {
    source: R,
    mfa_prompting: MfaPromptFlag,
    mfa_buffer: String,
}

impl<R: Read> InputDispatcher<R> {
    pub fn new(source: R, mfa_prompting: MfaPromptFlag) -> Self {
        Self {
            source,
            mfa_prompting,
            mfa_buffer: String::new(),
        }
    }

    /// Read and dispatch a single byte's worth of input. Returns
    /// `Ok(None)` at EOF, `Ok(Some(None))` when the byte was consumed
    /// without producing a dispatchable key (MFA sub-mode), or
    /// `Ok(Some(Some(key))))` for a normally-dispatched key.
    pub async fn dispatch_one(
        &mut self,
        keys: &mpsc::Sender<Key>,
        mfa_codes: &mpsc::Sender<String>,
    ) -> std::io::Result<Option<Option<Key>>> {
        let mut byte = [0u8; 1];
        let n = self.source.read(&mut byte)?;
        if n == 0 {
            return Ok(None);
        }
        let ch = byte[0] as char;

        if self.mfa_prompting.get() {
            match ch {
                '\n' | '\r' => {
                    let code = std::mem::take(&mut self.mfa_buffer);
                    self.mfa_prompting.set(false);
                    let _ = mfa_codes.send(code).await;
                }
                '\u{7f}' | '\u{8}' => {
                    self.mfa_buffer.pop();
                }
                c if c.is_ascii_digit() => {
                    self.mfa_buffer.push(c);
                }
                _ => {}
            }
            return Ok(Some(None));
        }

        let key = match ch {
            '\n' | '\r' => Key::Enter,
            '\u{7f}' | '\u{8}' => Key::Backspace,
            c => Key::Char(c),
        };
        // Capacity-1 channel: drop-newest semantics are fine here since
        // keys represent user intent, not data that must not be lost.
        let _ = keys.try_send(key.clone());
        Ok(Some(Some(key)))
    }

    /// Drives `dispatch_one` in a loop until the source is exhausted,
    /// intended to run as its own task alongside the coordinator, the
    /// part uploader, and the schedule driver.
    pub async fn run(
        mut self,
        keys: mpsc::Sender<Key>,
        mfa_codes: mpsc::Sender<String>,
    ) -> std::io::Result<()> {
        loop {
            if self.dispatch_one(&keys, &mfa_codes).await?.is_none() {
                return Ok(());
            }
        }
    }
}

/// Recognized keys, published as-is; meaning is assigned by the
/// coordinator's key-to-action mapping.
pub const RECOGNIZED_CHARS: &[char] = &[
    'i', 'u', 'r', 'a', 's', 'd', 'f', 'z', 'x', 'c', 'v', '0', '1', '2', '3', '4', '5', '6', '7',
    '8', '9', 'p', ' ', '?',
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn publishes_plain_characters_as_keys() {
        let mut dispatcher = InputDispatcher::new(Cursor::new(b"u".to_vec()), MfaPromptFlag::new());
        let (keys_tx, mut keys_rx) = mpsc::channel(1);
        let (mfa_tx, _mfa_rx) = mpsc::channel(1);

        let key = dispatcher.dispatch_one(&keys_tx, &mfa_tx).await.unwrap();
        assert_eq!(key, Some(Some(Key::Char('u'))));
        assert_eq!(keys_rx.try_recv().unwrap(), Key::Char('u'));
    }

    #[tokio::test]
    async fn mfa_submode_buffers_digits_until_enter() {
        let flag = MfaPromptFlag::new();
        flag.set(true);
        let mut dispatcher = InputDispatcher::new(Cursor::new(b"1234\n".to_vec()), flag);
        let (keys_tx, _keys_rx) = mpsc::channel(1);
        let (mfa_tx, mut mfa_rx) = mpsc::channel(1);

        for _ in 0..5 {
            dispatcher.dispatch_one(&keys_tx, &mfa_tx).await.unwrap();
        }
        assert_eq!(mfa_rx.try_recv().unwrap(), "1234");
    }

    #[tokio::test]
    async fn mfa_submode_backspace_deletes_one_digit() {
        let flag = MfaPromptFlag::new();
        flag.set(true);
        let mut dispatcher = InputDispatcher::new(Cursor::new(b"12\u{7f}3\n".to_vec()), flag);
        let (keys_tx, _keys_rx) = mpsc::channel(1);
        let (mfa_tx, mut mfa_rx) = mpsc::channel(1);

        for _ in 0..5 {
            dispatcher.dispatch_one(&keys_tx, &mfa_tx).await.unwrap();
        }
        assert_eq!(mfa_rx.try_recv().unwrap(), "13");
    }

    #[tokio::test]
    async fn eof_yields_none() {
        let mut dispatcher = InputDispatcher::new(Cursor::new(Vec::new()), MfaPromptFlag::new());
        let (keys_tx, _keys_rx) = mpsc::channel(1);
        let (mfa_tx, _mfa_rx) = mpsc::channel(1);
        assert_eq!(dispatcher.dispatch_one(&keys_tx, &mfa_tx).await.unwrap(), None);
    }
}
