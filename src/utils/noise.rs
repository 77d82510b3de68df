use candle_core::{Device, Result, Shape, Tensor};

/// PCG32 (XSH-RR) generator used for seeded latent noise.
///
/// Produces identical noise on every backend, unlike device-side RNGs whose
/// streams differ between CPU, CUDA and Metal.
#[derive(Debug, Clone)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    const MULTIPLIER: u64 = 6364136223846793005;

    pub fn new(seed: u64, stream: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: (stream << 1) | 1,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    pub fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.state = old.wrapping_mul(Self::MULTIPLIER).wrapping_add(self.inc);
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        let rot = (old >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Uniform in [0, 1) with 24 bits of precision.
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 * (1.0 / (1u32 << 24) as f32)
    }

    /// Pair of standard normal samples (Box-Muller).
    pub fn next_gaussian_pair(&mut self) -> (f32, f32) {
        let u1 = loop {
            let x = self.next_f32();
            if x > 1e-7 {
                break x;
            }
        };
        let u2 = self.next_f32();
        let mag = (-2.0 * u1.ln()).sqrt();
        let (sin, cos) = (2.0 * std::f32::consts::PI * u2).sin_cos();
        (mag * cos, mag * sin)
    }

    /// f32 tensor of standard normal samples.
    pub fn randn(&mut self, shape: impl Into<Shape>, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let n = shape.elem_count();
        let mut data = Vec::with_capacity(n + 1);
        while data.len() < n {
            let (z0, z1) = self.next_gaussian_pair();
            data.push(z0);
            data.push(z1);
        }
        data.truncate(n);
        Tensor::from_vec(data, shape, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_noise() -> Result<()> {
        let a = Pcg32::new(42, 0).randn((3, 5), &Device::Cpu)?.to_vec2::<f32>()?;
        let b = Pcg32::new(42, 0).randn((3, 5), &Device::Cpu)?.to_vec2::<f32>()?;
        let c = Pcg32::new(43, 0).randn((3, 5), &Device::Cpu)?.to_vec2::<f32>()?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        Ok(())
    }

    #[test]
    fn odd_element_count() -> Result<()> {
        let t = Pcg32::new(1, 0).randn(7, &Device::Cpu)?;
        assert_eq!(t.dims(), &[7]);
        Ok(())
    }
}
