//! Mock USB transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{TransportError, UsbTransport};

/// A captured host-to-device transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockWrite {
    Control { request: u8, value: u16, index: u16, data: Vec<u8> },
    Bulk(Vec<u8>),
}

/// Mock transport for unit testing protocol logic.
///
/// Clones share the response queue and write log, so a test can hand a clone
/// to the protocol and keep one for assertions.
#[derive(Clone)]
pub struct MockTransport {
    /// Queued device responses, shared by control-in and bulk-in.
    response_queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<MockWrite>>>,
    /// Simulated VID/PID.
    vid: u16,
    pid: u16,
    /// Whether the device is "connected".
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            response_queue: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            vid: 0x0421,
            pid: 0x0105,
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Queue a response to be returned on the next IN transfer.
    pub fn queue_response(&self, bytes: &[u8]) {
        self.response_queue.lock().unwrap().push_back(bytes.to_vec());
    }

    /// Get all captured writes.
    pub fn writes(&self) -> Vec<MockWrite> {
        self.write_log.lock().unwrap().clone()
    }

    /// Get only the bulk payloads, concatenated.
    pub fn bulk_bytes(&self) -> Vec<u8> {
        self.write_log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|w| match w {
                MockWrite::Bulk(data) => Some(data.clone()),
                MockWrite::Control { .. } => None,
            })
            .flatten()
            .collect()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Set VID/PID for re-enumeration testing.
    pub fn set_ids(&mut self, vid: u16, pid: u16) {
        self.vid = vid;
        self.pid = pid;
    }

    fn check_connected(&self) -> Result<(), TransportError> {
        if *self.connected.lock().unwrap() {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }

    fn pop_response(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        match self.response_queue.lock().unwrap().pop_front() {
            Some(response) => {
                let n = response.len().min(buf.len());
                buf[..n].copy_from_slice(&response[..n]);
                Ok(n)
            }
            None => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn control_out(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.check_connected()?;
        self.write_log.lock().unwrap().push(MockWrite::Control {
            request,
            value,
            index,
            data: data.to_vec(),
        });
        Ok(data.len())
    }

    fn control_in(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.check_connected()?;
        self.write_log.lock().unwrap().push(MockWrite::Control {
            request,
            value,
            index,
            data: Vec::new(),
        });
        self.pop_response(buf, timeout)
    }

    fn bulk_out(&self, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        self.check_connected()?;
        self.write_log
            .lock()
            .unwrap()
            .push(MockWrite::Bulk(data.to_vec()));
        Ok(data.len())
    }

    fn bulk_in(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        self.check_connected()?;
        self.pop_response(buf, timeout)
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_response_queue() {
        let mock = MockTransport::new();
        mock.queue_response(b"pong");

        let mut buf = [0u8; 8];
        let n = mock.bulk_in(&mut buf, Duration::from_millis(5)).unwrap();
        assert_eq!(&buf[..n], b"pong");

        // Queue is empty now.
        let err = mock.bulk_in(&mut buf, Duration::from_millis(5)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_mock_write_capture() {
        let mock = MockTransport::new();
        mock.bulk_out(b"abc", Duration::from_millis(5)).unwrap();
        mock.control_out(0x10, 1, 0, b"de", Duration::from_millis(5))
            .unwrap();

        let writes = mock.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], MockWrite::Bulk(b"abc".to_vec()));
        assert_eq!(mock.bulk_bytes(), b"abc");
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockTransport::new();
        mock.disconnect();
        assert!(matches!(
            mock.bulk_out(b"x", Duration::from_millis(5)),
            Err(TransportError::Disconnected)
        ));
    }
}
