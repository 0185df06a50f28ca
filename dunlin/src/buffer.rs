/// RX staging buffer for bytes that do not yet form a complete command.
#[derive(Default)]
pub struct Buffer {
  data: Vec<u8>,
}

impl Buffer {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn append(&mut self, data: &[u8]) {
    self.data.extend_from_slice(data);
  }

  /// Drop the first `n` bytes, shifting the rest to the front.
  pub fn remove_prefix(&mut self, n: usize) {
    self.data.drain(..n);
  }

  pub fn as_slice(&self) -> &[u8] {
    &self.data
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn append() {
    let mut buf = Buffer::new();
    assert_eq!(buf.len(), 0);

    let value = b"The quick brown fox jumps over the lazy dog";
    buf.append(value);
    assert_eq!(buf.len(), value.len());
    assert_eq!(buf.as_slice(), value);
  }

  #[test]
  fn remove_prefix_keeps_the_tail() {
    let mut buf = Buffer::new();
    buf.append(b"set foo");
    buf.append(b" 0 0 3");
    buf.remove_prefix(4);

    assert_eq!(buf.as_slice(), b"foo 0 0 3");
    buf.remove_prefix(buf.len());
    assert!(buf.is_empty());
  }
}
