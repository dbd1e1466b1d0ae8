//! ISO15765-2 (ISO-TP) segmentation of diagnostic payloads over CAN.
//!
//! Payloads of up to 7 bytes travel in a single frame; anything larger is
//! split into a first frame announcing the total length followed by
//! consecutive frames with a running 4-bit sequence number. The receiver
//! releases consecutive frames by sending a flow-control frame.

use log::{debug, warn};

/// Largest payload ISO-TP can carry (12-bit length field)
pub const MAX_PAYLOAD: usize = 0xFFF;

/// Data bytes per single frame
pub const SINGLE_FRAME_CAPACITY: usize = 7;

/// The flow control frame this tester sends: continue-to-send, no block
/// limit, no separation time
pub const CLEAR_TO_SEND: [u8; 3] = [0x30, 0x00, 0x00];

/// One decoded ISO-TP CAN frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoTpFrame {
    /// Complete payload of up to 7 bytes
    Single {
        /// The payload
        data: Vec<u8>,
    },
    /// Opens a multi-frame transfer
    First {
        /// Total payload length of the transfer
        total_len: usize,
        /// The first 6 payload bytes
        data: Vec<u8>,
    },
    /// Continuation of a multi-frame transfer
    Consecutive {
        /// 4-bit rolling sequence number (1,2,..,15,0,1,..)
        seq: u8,
        /// Up to 7 payload bytes
        data: Vec<u8>,
    },
    /// Receiver releasing the sender
    FlowControl {
        /// 0 = continue to send, 1 = wait, 2 = overflow/abort
        status: u8,
        /// Number of consecutive frames per block (0 = unlimited)
        block_size: u8,
        /// Minimum separation time between frames in ms
        st_min: u8,
    },
}

/// Decodes one CAN frame payload. Returns `None` for frames that are not
/// valid ISO-TP (empty, unknown PCI nibble, or a length that does not fit).
pub fn parse_frame(data: &[u8]) -> Option<IsoTpFrame> {
    let pci = *data.first()?;
    match pci & 0xF0 {
        0x00 => {
            let len = (pci & 0x0F) as usize;
            if len == 0 || len > SINGLE_FRAME_CAPACITY || data.len() < len + 1 {
                return None;
            }
            Some(IsoTpFrame::Single {
                data: data[1..1 + len].to_vec(),
            })
        }
        0x10 => {
            let total_len = (((pci & 0x0F) as usize) << 8) | (*data.get(1)? as usize);
            if total_len <= SINGLE_FRAME_CAPACITY {
                return None;
            }
            Some(IsoTpFrame::First {
                total_len,
                data: data.get(2..).unwrap_or(&[]).to_vec(),
            })
        }
        0x20 => Some(IsoTpFrame::Consecutive {
            seq: pci & 0x0F,
            data: data.get(1..).unwrap_or(&[]).to_vec(),
        }),
        0x30 => Some(IsoTpFrame::FlowControl {
            status: pci & 0x0F,
            block_size: data.get(1).copied().unwrap_or(0),
            st_min: data.get(2).copied().unwrap_or(0),
        }),
        _ => None,
    }
}

/// Splits `payload` into the CAN frame data sequence that carries it.
/// Frames are returned unpadded; pad to 8 bytes at the link layer if the
/// bus requires it. Panics only if `payload` exceeds [MAX_PAYLOAD], which
/// callers bound beforehand.
pub fn segment(payload: &[u8]) -> Vec<Vec<u8>> {
    assert!(payload.len() <= MAX_PAYLOAD);
    if payload.len() <= SINGLE_FRAME_CAPACITY {
        let mut f = Vec::with_capacity(payload.len() + 1);
        f.push(payload.len() as u8);
        f.extend_from_slice(payload);
        return vec![f];
    }

    let mut frames = Vec::with_capacity(1 + payload.len() / 7);
    let mut first = Vec::with_capacity(8);
    first.push(0x10 | ((payload.len() >> 8) as u8 & 0x0F));
    first.push(payload.len() as u8);
    first.extend_from_slice(&payload[..6]);
    frames.push(first);

    let mut seq = 1u8;
    for chunk in payload[6..].chunks(7) {
        let mut f = Vec::with_capacity(chunk.len() + 1);
        f.push(0x20 | seq);
        f.extend_from_slice(chunk);
        frames.push(f);
        seq = (seq + 1) & 0x0F;
    }
    frames
}

/// What the assembler wants after consuming a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembly {
    /// More frames needed
    Pending,
    /// A first frame arrived; the caller should transmit [CLEAR_TO_SEND]
    /// and keep feeding frames
    SendFlowControl,
    /// Transfer complete
    Complete(Vec<u8>),
}

/// Reassembles multi-frame ISO-TP transfers.
///
/// Feed every inbound CAN frame through [IsoTpAssembler::push_frame]. Flow
/// control frames from either side are tolerated and ignored, so the
/// tester's own `30 00 00` echoing back through a loopback path does not
/// disturb an in-progress transfer.
#[derive(Debug, Default)]
pub struct IsoTpAssembler {
    buf: Vec<u8>,
    expected: usize,
    next_seq: u8,
    active: bool,
}

impl IsoTpAssembler {
    /// Creates an idle assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops any partial transfer
    pub fn reset(&mut self) {
        self.buf.clear();
        self.expected = 0;
        self.next_seq = 0;
        self.active = false;
    }

    /// Consumes one CAN frame payload. Non-ISO-TP frames and out-of-order
    /// consecutive frames abandon the current transfer rather than error,
    /// matching how the bus behaves when another conversation interleaves.
    pub fn push_frame(&mut self, data: &[u8]) -> Assembly {
        match parse_frame(data) {
            Some(IsoTpFrame::Single { data }) => {
                self.reset();
                Assembly::Complete(data)
            }
            Some(IsoTpFrame::First { total_len, data }) => {
                self.buf.clear();
                self.buf.extend_from_slice(&data);
                self.expected = total_len;
                self.next_seq = 1;
                self.active = true;
                debug!("isotp first frame, expecting {} bytes", total_len);
                Assembly::SendFlowControl
            }
            Some(IsoTpFrame::Consecutive { seq, data }) => {
                if !self.active {
                    return Assembly::Pending;
                }
                if seq != self.next_seq {
                    warn!(
                        "isotp sequence mismatch (got {}, wanted {}), dropping transfer",
                        seq, self.next_seq
                    );
                    self.reset();
                    return Assembly::Pending;
                }
                self.next_seq = (self.next_seq + 1) & 0x0F;
                let remaining = self.expected - self.buf.len();
                self.buf.extend_from_slice(&data[..data.len().min(remaining)]);
                if self.buf.len() >= self.expected {
                    let payload = std::mem::take(&mut self.buf);
                    self.reset();
                    Assembly::Complete(payload)
                } else {
                    Assembly::Pending
                }
            }
            // Our own flow control coming back, or the ECU pacing us
            Some(IsoTpFrame::FlowControl { .. }) => Assembly::Pending,
            None => {
                if self.active {
                    warn!("non ISO-TP frame during transfer: {:02X?}", data);
                }
                Assembly::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_round_trip() {
        let payload = [0x01, 0x0C];
        let frames = segment(&payload);
        assert_eq!(frames, vec![vec![0x02, 0x01, 0x0C]]);

        let mut asm = IsoTpAssembler::new();
        assert_eq!(
            asm.push_frame(&frames[0]),
            Assembly::Complete(payload.to_vec())
        );
    }

    #[test]
    fn multi_frame_round_trip() {
        let payload: Vec<u8> = (0..40).collect();
        let frames = segment(&payload);
        assert_eq!(frames[0][0], 0x10);
        assert_eq!(frames[0][1], 40);
        assert_eq!(frames[1][0], 0x21);

        let mut asm = IsoTpAssembler::new();
        let mut result = None;
        for f in &frames {
            match asm.push_frame(f) {
                Assembly::Complete(p) => result = Some(p),
                _ => {}
            }
        }
        assert_eq!(result, Some(payload));
    }

    #[test]
    fn single_and_multi_agree_on_same_payload() {
        // A 7 byte payload can travel either way; both must reassemble
        // identically
        let payload = [0x07u8, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
        let mut asm = IsoTpAssembler::new();

        let mut single = vec![0x07];
        single.extend_from_slice(&payload);
        let from_single = match asm.push_frame(&single) {
            Assembly::Complete(p) => p,
            other => panic!("unexpected {other:?}"),
        };

        let ff = [0x10, 0x07, payload[0], payload[1], payload[2], payload[3]];
        // 12-bit length of 7 is not a legal first frame, so build one with
        // 8 bytes to stay honest about the protocol
        assert_eq!(asm.push_frame(&ff), Assembly::Pending);

        let mut asm2 = IsoTpAssembler::new();
        let long: Vec<u8> = payload.iter().chain([0x77u8].iter()).copied().collect();
        let frames = segment(&long);
        assert_eq!(asm2.push_frame(&frames[0]), Assembly::SendFlowControl);
        let from_multi = match asm2.push_frame(&frames[1]) {
            Assembly::Complete(p) => p,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(from_single, from_multi[..7]);
    }

    #[test]
    fn vin_multi_frame() {
        // Mode 09 PID 02 response split across three frames
        let mut asm = IsoTpAssembler::new();
        assert_eq!(
            asm.push_frame(&[0x10, 0x14, 0x49, 0x02, 0x01, 0x31, 0x4F, 0x50]),
            Assembly::SendFlowControl
        );
        assert_eq!(
            asm.push_frame(&[0x21, 0x45, 0x4E, 0x44, 0x49, 0x41, 0x47, 0x30]),
            Assembly::Pending
        );
        let done = asm.push_frame(&[0x22, 0x54, 0x45, 0x53, 0x54, 0x31, 0x32, 0x33]);
        let payload = match done {
            Assembly::Complete(p) => p,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(payload[0], 0x49);
        assert_eq!(payload[1], 0x02);
        let vin = String::from_utf8_lossy(&payload[3..]);
        assert_eq!(vin, "1OPENDIAG0TEST123");
    }

    #[test]
    fn own_flow_control_is_tolerated() {
        let payload: Vec<u8> = (0..20).collect();
        let frames = segment(&payload);
        let mut asm = IsoTpAssembler::new();
        assert_eq!(asm.push_frame(&frames[0]), Assembly::SendFlowControl);
        // Loopback of our own FC between first and consecutive frames
        assert_eq!(asm.push_frame(&CLEAR_TO_SEND), Assembly::Pending);
        assert_eq!(asm.push_frame(&frames[1]), Assembly::Pending);
        match asm.push_frame(&frames[2]) {
            Assembly::Complete(p) => assert_eq!(p, payload),
            other => panic!("unexpected {other:?}"),
        }
    }
}
