// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The byte-channel abstraction `BslClient` drives. Three physically
//! distinct links (full-duplex UART, one-wire UART with local echo, UART
//! "reply mode", and SPI) share this trait; mode-specific echo/reply
//! handling happens inside the `send`/`receive` implementations so upper
//! layers never special-case the link.

use std::time::Duration;

use crate::error::TransportError;

/// Serial parity, as configured on a UART link. SPI transports ignore this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
}

/// Which of the three UART wiring conventions (or SPI) a session is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UartMode {
    /// Full-duplex, two wires, even parity.
    Duplex,
    /// Single wire; every transmitted byte loops back as a local echo that
    /// must be consumed before a genuine reply is read.
    OneWire,
    /// Two wires, but the target expects the host to echo every received
    /// byte back before it proceeds.
    TwoWireReply,
}

/// A bidirectional byte channel to the target, already open.
///
/// The core never opens a device: an external factory hands the client an
/// implementation of this trait, configured with the right baud rate and
/// framing. `send`/`receive` are the only blocking points in the whole
/// crate (together with the explicit sleeps `BslClient` issues around SPI
/// programming latency).
pub trait Transport {
    /// Transmits `bytes` in full. Either every byte is sent or a
    /// `TransportError` is raised — a partial write is never silently
    /// treated as success.
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Blocks up to the configured timeout and returns exactly `n` bytes,
    /// or `TransportError::Timeout` carrying however many bytes actually
    /// arrived.
    fn receive(&mut self, n: usize) -> Result<Vec<u8>, TransportError>;

    /// Discards any buffered, unread RX data.
    fn flush(&mut self) -> Result<(), TransportError>;

    /// Sets parity. Implementations must flush pending RX data first so a
    /// byte framed under the old parity never straddles into the new mode.
    fn set_parity(&mut self, parity: Parity) -> Result<(), TransportError>;

    /// Sets the receive timeout used by subsequent `receive` calls.
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// Optional: pulses a reset line for `duration`. Transports that have
    /// no such control line simply no-op; automatic target reset is not
    /// part of this crate's scope.
    fn pulse_reset(&mut self, _duration: Duration) -> Result<(), TransportError> {
        Ok(())
    }

    /// `true` for SPI transports, which need the host to insert
    /// programming delays between frames rather than relying on a receive
    /// timeout to absorb target latency.
    fn is_spi(&self) -> bool {
        false
    }
}

/// Sends `bytes` and, for [`UartMode::OneWire`], transparently consumes and
/// discards the local echo. Other modes pass straight through.
///
/// `TwoWireReply`'s obligation (echoing received bytes back) lives on the
/// receive side; see [`receive_with_mode`].
pub fn send_with_mode<T: Transport + ?Sized>(
    transport: &mut T,
    mode: UartMode,
    bytes: &[u8],
) -> Result<(), TransportError> {
    transport.send(bytes)?;
    if mode == UartMode::OneWire {
        let echo = transport.receive(bytes.len())?;
        if echo != bytes {
            // The echo not matching what we sent means the link dropped or
            // corrupted a byte; surface it as a short write rather than
            // silently discarding mismatched data.
            return Err(TransportError::ShortWrite {
                wrote: echo.iter().zip(bytes).take_while(|(a, b)| a == b).count(),
                requested: bytes.len(),
            });
        }
    }
    Ok(())
}

/// Receives `n` bytes and, for [`UartMode::TwoWireReply`], echoes each one
/// back to the transmitter before returning. Other modes pass straight
/// through.
pub fn receive_with_mode<T: Transport + ?Sized>(
    transport: &mut T,
    mode: UartMode,
    n: usize,
) -> Result<Vec<u8>, TransportError> {
    if mode == UartMode::TwoWireReply {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let byte = transport.receive(1)?;
            transport.send(&byte)?;
            out.push(byte[0]);
        }
        Ok(out)
    } else {
        transport.receive(n)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;

    /// A byte-scripted fake transport for exercising `BslClient` without
    /// real hardware. `expect` queues bytes the test expects the client to
    /// send (checked against, but not enforced byte-for-byte unless the
    /// caller calls `take_sent`); `reply` queues bytes to hand back on the
    /// next `receive` calls, in order.
    pub struct MockTransport {
        pub sent: Vec<u8>,
        pub rx: VecDeque<u8>,
        pub parity: Parity,
        pub timeout: Duration,
        pub spi: bool,
    }

    impl MockTransport {
        pub fn new() -> Self {
            MockTransport {
                sent: Vec::new(),
                rx: VecDeque::new(),
                parity: Parity::None,
                timeout: Duration::from_millis(100),
                spi: false,
            }
        }

        pub fn queue_rx(&mut self, bytes: &[u8]) {
            self.rx.extend(bytes.iter().copied());
        }

        pub fn take_sent(&mut self) -> Vec<u8> {
            std::mem::take(&mut self.sent)
        }
    }

    impl Transport for MockTransport {
        fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.sent.extend_from_slice(bytes);
            Ok(())
        }

        fn receive(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
            let mut out = Vec::with_capacity(n);
            for _ in 0..n {
                match self.rx.pop_front() {
                    Some(b) => out.push(b),
                    None => {
                        return Err(TransportError::Timeout {
                            expected: n,
                            got: out.len(),
                        })
                    }
                }
            }
            Ok(out)
        }

        fn flush(&mut self) -> Result<(), TransportError> {
            self.rx.clear();
            Ok(())
        }

        fn set_parity(&mut self, parity: Parity) -> Result<(), TransportError> {
            self.flush()?;
            self.parity = parity;
            Ok(())
        }

        fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
            self.timeout = timeout;
            Ok(())
        }

        fn is_spi(&self) -> bool {
            self.spi
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;

    #[test]
    fn one_wire_send_consumes_echo() {
        let mut t = MockTransport::new();
        t.queue_rx(&[0xAB, 0xCD]);
        send_with_mode(&mut t, UartMode::OneWire, &[0xAB, 0xCD]).unwrap();
        assert!(t.rx.is_empty());
        assert_eq!(t.sent, vec![0xAB, 0xCD]);
    }

    #[test]
    fn duplex_send_does_not_touch_rx() {
        let mut t = MockTransport::new();
        t.queue_rx(&[0x79]);
        send_with_mode(&mut t, UartMode::Duplex, &[0x00, 0xFF]).unwrap();
        assert_eq!(t.rx.len(), 1);
    }

    #[test]
    fn two_wire_reply_echoes_each_byte() {
        let mut t = MockTransport::new();
        t.queue_rx(&[0x11, 0x22, 0x33]);
        let got = receive_with_mode(&mut t, UartMode::TwoWireReply, 3).unwrap();
        assert_eq!(got, vec![0x11, 0x22, 0x33]);
        assert_eq!(t.sent, vec![0x11, 0x22, 0x33]);
    }

    #[test]
    fn receive_timeout_carries_partial_count() {
        let mut t = MockTransport::new();
        t.queue_rx(&[0x01, 0x02]);
        let err = t.receive(5).unwrap_err();
        match err {
            TransportError::Timeout { expected, got } => {
                assert_eq!(expected, 5);
                assert_eq!(got, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
