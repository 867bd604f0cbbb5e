//! X11 root-window capture
//!
//! Grabs the root window with XGetImage and converts to packed RGB.

use super::capturer::{resample_rgb, CaptureProvider, CaptureRequest, CaptureSource, GrantPath};
use super::frame::{Frame, FrameStats};
use super::CaptureError;
use log::debug;
use std::time::{Duration, Instant};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{ConnectionExt, ImageFormat, Window};
use x11rb::rust_connection::RustConnection;

/// Byte order constants
const BYTE_ORDER_LSB_FIRST: u8 = 0;

/// Grab cadence, close to a 60 Hz display refresh
const GRAB_INTERVAL: Duration = Duration::from_millis(16);

/// Screen capturer using X11
pub struct X11Capturer {
    conn: RustConnection,
    root: Window,

    /// Native screen size
    width: u32,
    height: u32,

    /// Output size requested by the engine
    out_width: u32,
    out_height: u32,

    depth: u8,
    byte_order: u8,
    bytes_per_pixel: usize,
    bytes_per_line: usize,

    last_grab: Option<Instant>,
    sequence: u64,
    stats: FrameStats,
}

impl X11Capturer {
    /// Connect to `display` and prepare a capturer producing `out_width`x`out_height`
    pub fn open(display: Option<&str>, out_width: u32, out_height: u32) -> Result<Self, CaptureError> {
        let (conn, screen_num) = x11rb::connect(display)
            .map_err(|e| CaptureError::Unavailable(format!("X11 connect failed: {}", e)))?;

        let setup = conn.setup();
        let screen = setup
            .roots
            .get(screen_num)
            .ok_or_else(|| CaptureError::Unavailable(format!("X11 screen {} missing", screen_num)))?;
        let root = screen.root;
        let width = screen.width_in_pixels as u32;
        let height = screen.height_in_pixels as u32;
        let depth = screen.root_depth;
        let byte_order = u8::from(setup.image_byte_order);
        let (bytes_per_pixel, bytes_per_line) = compute_format(&conn, width, depth);

        Ok(Self {
            conn,
            root,
            width,
            height,
            out_width: if out_width == 0 { width } else { out_width },
            out_height: if out_height == 0 { height } else { out_height },
            depth,
            byte_order,
            bytes_per_pixel,
            bytes_per_line,
            last_grab: None,
            sequence: 0,
            stats: FrameStats::default(),
        })
    }

    /// Native screen dimensions
    pub fn screen_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn grab(&self) -> Result<Vec<u8>, CaptureError> {
        let image = self
            .conn
            .get_image(
                ImageFormat::Z_PIXMAP,
                self.root,
                0,
                0,
                self.width as u16,
                self.height as u16,
                u32::MAX,
            )
            .map_err(|e| CaptureError::SourceFailed(format!("GetImage request failed: {}", e)))?
            .reply()
            .map_err(|e| CaptureError::SourceFailed(format!("GetImage reply failed: {}", e)))?;
        let rows = self.effective_height(image.data.len());
        Ok(self.convert_raw_to_rgb(&image.data, rows))
    }

    /// Convert raw image data to RGB format
    fn convert_raw_to_rgb(&self, src: &[u8], height: u32) -> Vec<u8> {
        let mut dst = Vec::with_capacity((self.width * height * 3) as usize);

        match self.depth {
            24 | 32 => {
                for y in 0..height as usize {
                    for x in 0..self.width as usize {
                        let offset = y * self.bytes_per_line + x * self.bytes_per_pixel;
                        if let Some(px) = src.get(offset..offset + 3) {
                            if self.byte_order == BYTE_ORDER_LSB_FIRST {
                                dst.extend_from_slice(&[px[2], px[1], px[0]]);
                            } else {
                                dst.extend_from_slice(px);
                            }
                        }
                    }
                }
            }
            16 => {
                for y in 0..height as usize {
                    for x in 0..self.width as usize {
                        let offset = y * self.bytes_per_line + x * self.bytes_per_pixel;
                        if let Some(px) = src.get(offset..offset + 2) {
                            let pixel = u16::from_le_bytes([px[0], px[1]]);
                            let r = ((pixel >> 11) & 0x1F) as u8;
                            let g = ((pixel >> 5) & 0x3F) as u8;
                            let b = (pixel & 0x1F) as u8;
                            dst.extend_from_slice(&[r << 3, g << 2, b << 3]);
                        }
                    }
                }
            }
            _ => {
                debug!("Unsupported depth: {}, using grayscale", self.depth);
                let step = self.bytes_per_pixel.max(1);
                for byte in src.iter().step_by(step) {
                    dst.extend_from_slice(&[*byte, *byte, *byte]);
                }
            }
        }

        dst
    }

    fn effective_height(&self, data_len: usize) -> u32 {
        let max_rows = data_len / self.bytes_per_line.max(1);
        let height = max_rows.min(self.height as usize) as u32;
        if height != self.height {
            debug!("Truncated frame: expected {} rows, got {} rows", self.height, height);
        }
        height
    }
}

impl CaptureSource for X11Capturer {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        if let Some(last) = self.last_grab {
            let elapsed = last.elapsed();
            if elapsed < GRAB_INTERVAL {
                std::thread::sleep(GRAB_INTERVAL - elapsed);
            }
        }
        let start = Instant::now();
        self.last_grab = Some(start);

        let raw = self.grab()?;
        let rows = (raw.len() / (self.width as usize * 3).max(1)) as u32;
        let data = resample_rgb(&raw, self.width, rows, self.out_width, self.out_height);
        self.stats.record_capture(data.len(), start.elapsed().as_micros() as u64);

        let frame = Frame {
            width: self.out_width,
            height: self.out_height,
            data,
            timestamp: start,
            sequence: self.sequence,
        };
        self.sequence += 1;
        Ok(frame)
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.out_width, self.out_height)
    }

    fn stats(&self) -> FrameStats {
        self.stats.clone()
    }
}

/// System-granted provider backed by an X display
pub struct X11Provider {
    display: Option<String>,
}

impl X11Provider {
    pub fn new(display: Option<String>) -> Self {
        Self { display }
    }
}

impl CaptureProvider for X11Provider {
    fn name(&self) -> &str {
        "x11"
    }

    fn grant(&self) -> GrantPath {
        GrantPath::System
    }

    fn open(&self, request: &CaptureRequest) -> Result<Box<dyn CaptureSource>, CaptureError> {
        let capturer = X11Capturer::open(self.display.as_deref(), request.width, request.height)?;
        debug!(
            "X11 capture: screen {:?} -> {}x{}",
            capturer.screen_size(),
            request.width,
            request.height
        );
        Ok(Box::new(capturer))
    }
}

fn compute_format(conn: &RustConnection, width: u32, depth: u8) -> (usize, usize) {
    let mut bytes_per_pixel = 4usize;
    let mut bytes_per_line = width as usize * bytes_per_pixel;
    for format in &conn.setup().pixmap_formats {
        if format.depth == depth {
            let bpp = format.bits_per_pixel as usize;
            let pad = (format.scanline_pad as usize).max(1);
            bytes_per_pixel = (bpp / 8).max(1);
            let bits_per_line = width as usize * bpp;
            let padded_bits = ((bits_per_line + pad - 1) / pad) * pad;
            bytes_per_line = padded_bits / 8;
            return (bytes_per_pixel, bytes_per_line);
        }
    }
    (bytes_per_pixel, bytes_per_line)
}
