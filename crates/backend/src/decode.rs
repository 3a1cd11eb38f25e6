/// Incremental UTF-8 decoder for streamed response bodies.
///
/// Network chunk boundaries do not respect character boundaries, so an
/// incomplete trailing sequence is held back until the next chunk arrives.
/// Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8FragmentDecoder {
    pending: Vec<u8>,
}

impl Utf8FragmentDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes as much of the buffered input as forms complete characters.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut decoded = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    decoded.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(error) => {
                    let valid_up_to = error.valid_up_to();
                    decoded.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));

                    match error.error_len() {
                        Some(invalid_len) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + invalid_len);
                        }
                        None => {
                            self.pending.drain(..valid_up_to);
                            break;
                        }
                    }
                }
            }
        }

        decoded
    }

    /// Flushes whatever is still buffered once the body has ended.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
