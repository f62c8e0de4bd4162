use anyhow::{Result, ensure};

use crate::emulator::GrayScreen;

fn blit_gray_to_u32(pixels: &[u8], out: &mut [u32]) {
    for (dst, &p) in out.iter_mut().zip(pixels) {
        let p = p as u32;
        *dst = (p << 16) | (p << 8) | p;
    }
}

/// Window showing the emulator's grayscale screen during evaluation.
pub struct Viewer {
    window: minifb::Window,
    buf: Vec<u32>,
    width: usize,
    height: usize,
}

impl Viewer {
    pub fn new(title: &str, width: usize, height: usize) -> Result<Self> {
        let mut window = minifb::Window::new(
            title,
            width,
            height,
            minifb::WindowOptions {
                resize: true,
                scale: minifb::Scale::X2,
                ..Default::default()
            },
        )?;
        window.set_target_fps(60);
        Ok(Self {
            window,
            buf: vec![0u32; width * height],
            width,
            height,
        })
    }

    /// Draws one screen. Returns `false` once the window is closed.
    pub fn show(&mut self, screen: &GrayScreen) -> Result<bool> {
        ensure!(
            screen.width == self.width && screen.height == self.height,
            "screen is {}x{}, window is {}x{}",
            screen.width,
            screen.height,
            self.width,
            self.height
        );
        blit_gray_to_u32(&screen.pixels, &mut self.buf);
        self.window
            .update_with_buffer(&self.buf, self.width, self.height)?;
        Ok(self.is_open())
    }

    pub fn is_open(&self) -> bool {
        self.window.is_open() && !self.window.is_key_down(minifb::Key::Escape)
    }
}
