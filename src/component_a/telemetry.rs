//! telemetry.rs
//! Fixed-layout binary telemetry frame, little-endian, explicit offsets.
//!
//! ```text
//! u16  header 0xAA55
//! u32  timestamp (ms since boot)
//! f32  setpoint[N]   (-1.0 when invalid)
//! f32  pressure[N]
//! f32  duty[N]       (signed %)
//! f32  distance[N]   (sector minimums, cm)
//! u8   scan angle
//! f32  live reading
//! u8   mode (0 manual, 1 forward, 2 bidirectional)
//! ---- extended only ----
//! u8   sensor flags (bit0 primary, bit1 secondary)
//! f32  force_scale
//! f32  distance_scale
//! f32  thresholds[3]
//! ----
//! u16  CRC-16/CCITT over everything between header and CRC
//! ```

use crate::component_a::sync_manager::SharedState;
use crate::config::NUM_CHANNELS;
use crate::error::FrameError;

pub const FRAME_HEADER: u16 = 0xAA55;

const HEADER_LEN: usize = 2;
const CRC_LEN: usize = 2;
const CORE_PAYLOAD_LEN: usize = 4 + 4 * 4 * NUM_CHANNELS + 1 + 4 + 1;
const EXTENSION_LEN: usize = 1 + 4 + 4 + 3 * 4;

/// 78 bytes with four channels.
pub const BASIC_FRAME_LEN: usize = HEADER_LEN + CORE_PAYLOAD_LEN + CRC_LEN;
/// 99 bytes with four channels.
pub const EXTENDED_FRAME_LEN: usize = BASIC_FRAME_LEN + EXTENSION_LEN;

/// CRC-16/CCITT: poly 0x1021, init 0xFFFF, no reflection, no final xor.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtendedFields {
    pub sensor_flags: u8,
    pub force_scale: f32,
    pub distance_scale: f32,
    pub thresholds: [f32; 3],
}

/// Immutable snapshot of everything one frame carries.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryFrame {
    pub timestamp_ms: u32,
    pub setpoints: [f32; NUM_CHANNELS],
    pub pressures: [f32; NUM_CHANNELS],
    pub duties: [f32; NUM_CHANNELS],
    pub distances: [f32; NUM_CHANNELS],
    pub scan_angle: u8,
    pub live_reading: f32,
    pub mode: u8,
    pub extended: Option<ExtendedFields>,
}

impl TelemetryFrame {
    /// Reads every field through the lock-free accessors; never waits on the sector lock.
    pub fn snapshot(shared: &SharedState, extended: bool) -> Self {
        let (force_scale, distance_scale) = shared.scales();
        Self {
            timestamp_ms: shared.uptime_ms(),
            setpoints: std::array::from_fn(|i| shared.setpoint(i)),
            pressures: std::array::from_fn(|i| shared.pressure(i)),
            duties: std::array::from_fn(|i| shared.duty(i)),
            distances: std::array::from_fn(|i| shared.sector_fallback(i).distance_cm),
            scan_angle: shared.scan_angle(),
            live_reading: shared.live_reading(),
            mode: shared.params.telemetry_mode(),
            extended: extended.then(|| ExtendedFields {
                sensor_flags: shared.sensor_flags(),
                force_scale,
                distance_scale,
                thresholds: shared.thresholds(),
            }),
        }
    }

    pub fn encoded_len(&self) -> usize {
        if self.extended.is_some() {
            EXTENDED_FRAME_LEN
        } else {
            BASIC_FRAME_LEN
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&FRAME_HEADER.to_le_bytes());
        buf.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        for group in [&self.setpoints, &self.pressures, &self.duties, &self.distances] {
            for v in group {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
        buf.push(self.scan_angle);
        buf.extend_from_slice(&self.live_reading.to_le_bytes());
        buf.push(self.mode);

        if let Some(ext) = &self.extended {
            buf.push(ext.sensor_flags);
            buf.extend_from_slice(&ext.force_scale.to_le_bytes());
            buf.extend_from_slice(&ext.distance_scale.to_le_bytes());
            for t in ext.thresholds {
                buf.extend_from_slice(&t.to_le_bytes());
            }
        }

        let crc = crc16_ccitt(&buf[HEADER_LEN..]);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }
}

/// Little-endian field reader over a length-checked payload.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.take())
    }

    fn f32s<const N: usize>(&mut self) -> [f32; N] {
        std::array::from_fn(|_| self.f32())
    }
}

/// Consumer side: validates length, header and CRC, then decodes. Never repairs.
pub fn decode(frame: &[u8]) -> Result<TelemetryFrame, FrameError> {
    let extended = match frame.len() {
        BASIC_FRAME_LEN => false,
        EXTENDED_FRAME_LEN => true,
        actual => {
            return Err(FrameError::Length {
                expected: BASIC_FRAME_LEN,
                actual,
            });
        }
    };

    let header = u16::from_le_bytes([frame[0], frame[1]]);
    if header != FRAME_HEADER {
        return Err(FrameError::Header(header));
    }

    let crc_at = frame.len() - CRC_LEN;
    let carried = u16::from_le_bytes([frame[crc_at], frame[crc_at + 1]]);
    let computed = crc16_ccitt(&frame[HEADER_LEN..crc_at]);
    if carried != computed {
        return Err(FrameError::Checksum {
            expected: computed,
            actual: carried,
        });
    }

    let mut r = Reader { buf: frame, pos: HEADER_LEN };
    let timestamp_ms = r.u32();
    let setpoints = r.f32s();
    let pressures = r.f32s();
    let duties = r.f32s();
    let distances = r.f32s();
    let scan_angle = r.u8();
    let live_reading = r.f32();
    let mode = r.u8();
    let extended = extended.then(|| ExtendedFields {
        sensor_flags: r.u8(),
        force_scale: r.f32(),
        distance_scale: r.f32(),
        thresholds: r.f32s(),
    });

    Ok(TelemetryFrame {
        timestamp_ms,
        setpoints,
        pressures,
        duties,
        distances,
        scan_angle,
        live_reading,
        mode,
        extended,
    })
}
