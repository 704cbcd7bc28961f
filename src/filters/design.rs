//! IIR filter design.
//!
//! Produces cascaded second-order sections for low-pass and high-pass
//! filters of the four classic families. The pipeline is the standard one:
//! analog prototype in zero/pole/gain form, low-pass frequency transform
//! with bilinear prewarping, bilinear transform to the z-plane, then
//! conjugate pairing into biquad sections.
//!
//! Elliptic prototypes use the Landen-recursion evaluation of the Jacobi
//! elliptic functions, which converges in a handful of iterations for any
//! usable modulus.

use std::f64::consts::PI;

use num_complex::Complex64;

use crate::error::{EngineError, Result};

/// One second-order section with `a0` normalized to 1.
#[derive(Debug, Clone, Copy)]
pub struct Sos {
    pub b: [f64; 3],
    pub a: [f64; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterFamily {
    Butterworth,
    Cheby1,
    Cheby2,
    Elliptic,
}

impl FilterFamily {
    /// Parse the config-level family name. `"none"` (or empty) disables the
    /// stage and maps to `None`.
    pub fn parse(name: &str) -> Result<Option<Self>> {
        match name.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(None),
            "butter" | "butterworth" => Ok(Some(Self::Butterworth)),
            "cheby1" | "chebyshev1" => Ok(Some(Self::Cheby1)),
            "cheby2" | "chebyshev2" => Ok(Some(Self::Cheby2)),
            "ellip" | "elliptic" => Ok(Some(Self::Elliptic)),
            other => Err(EngineError::BadStepConfig(format!(
                "unknown filter family \"{other}\""
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandType {
    Lowpass,
    Highpass,
}

/// Design a low-pass or high-pass IIR filter as second-order sections.
///
/// `rp` is the passband ripple in dB (Cheby-I, elliptic), `rs` the stopband
/// attenuation in dB (Cheby-II, elliptic); families that do not use a
/// parameter ignore it.
pub fn design_iir(
    order: usize,
    cutoff_hz: f64,
    rp: Option<f64>,
    rs: Option<f64>,
    family: FilterFamily,
    band: BandType,
    fs: f64,
) -> Result<Vec<Sos>> {
    if order == 0 {
        return Err(EngineError::BadStepConfig("filter order must be > 0".into()));
    }
    if !(0.0..fs / 2.0).contains(&cutoff_hz) || cutoff_hz <= 0.0 {
        return Err(EngineError::BadStepConfig(format!(
            "cutoff {cutoff_hz} Hz outside (0, {})",
            fs / 2.0
        )));
    }

    let (zeros, poles, gain) = match family {
        FilterFamily::Butterworth => butter_prototype(order),
        FilterFamily::Cheby1 => {
            let rp = rp.ok_or_else(|| EngineError::BadStepConfig("cheby1 requires rp".into()))?;
            cheby1_prototype(order, rp)
        }
        FilterFamily::Cheby2 => {
            let rs = rs.ok_or_else(|| EngineError::BadStepConfig("cheby2 requires rs".into()))?;
            cheby2_prototype(order, rs)
        }
        FilterFamily::Elliptic => {
            let rp = rp.ok_or_else(|| EngineError::BadStepConfig("elliptic requires rp".into()))?;
            let rs = rs.ok_or_else(|| EngineError::BadStepConfig("elliptic requires rs".into()))?;
            elliptic_prototype(order, rp, rs)
        }
    };

    // Bilinear prewarp so the digital cutoff lands exactly on target.
    let warped = 2.0 * fs * (PI * cutoff_hz / fs).tan();

    let (zeros, poles, gain) = match band {
        BandType::Lowpass => lp_to_lp(&zeros, &poles, gain, warped),
        BandType::Highpass => lp_to_hp(&zeros, &poles, gain, warped),
    };

    let (zeros, poles, gain) = bilinear(&zeros, &poles, gain, fs);

    Ok(zpk_to_sos(&zeros, &poles, gain))
}

type Zpk = (Vec<Complex64>, Vec<Complex64>, f64);

/// Butterworth analog prototype: poles evenly spaced on the unit circle's
/// left half, unity gain, no finite zeros.
fn butter_prototype(order: usize) -> Zpk {
    let n = order as f64;
    let poles = (0..order)
        .map(|m| Complex64::from_polar(1.0, PI * (2.0 * m as f64 + n + 1.0) / (2.0 * n)))
        .collect();

    (Vec::new(), poles, 1.0)
}

/// Chebyshev type I: poles on an ellipse, rp dB of passband ripple.
fn cheby1_prototype(order: usize, rp: f64) -> Zpk {
    let n = order as f64;
    let eps = (10f64.powf(rp / 10.0) - 1.0).sqrt();
    let mu = (1.0 / eps).asinh() / n;

    let poles: Vec<Complex64> = (0..order)
        .map(|i| {
            let m = -(n - 1.0) + 2.0 * i as f64;
            let theta = PI * m / (2.0 * n);
            -Complex64::new(mu, theta).sinh()
        })
        .collect();

    let mut gain = poles.iter().map(|&p| -p).product::<Complex64>().re;
    if order % 2 == 0 {
        gain /= (1.0 + eps * eps).sqrt();
    }

    (Vec::new(), poles, gain)
}

/// Chebyshev type II: imaginary-axis zeros, rs dB stopband attenuation.
fn cheby2_prototype(order: usize, rs: f64) -> Zpk {
    let n = order as f64;
    let de = 1.0 / (10f64.powf(rs / 10.0) - 1.0).sqrt();
    let mu = (1.0 / de).asinh() / n;

    let ms: Vec<f64> = (0..order)
        .map(|i| -(n - 1.0) + 2.0 * i as f64)
        .collect();

    // The middle angle of an odd order puts a zero at infinity; skip it.
    let zeros: Vec<Complex64> = ms
        .iter()
        .filter(|&&m| m != 0.0)
        .map(|&m| {
            let theta = PI * m / (2.0 * n);
            Complex64::new(0.0, 1.0 / theta.sin())
        })
        .collect();

    let poles: Vec<Complex64> = ms
        .iter()
        .map(|&m| {
            let theta = PI * m / (2.0 * n);
            let p = -Complex64::from_polar(1.0, theta);
            let p = Complex64::new(mu.sinh() * p.re, mu.cosh() * p.im);
            p.inv()
        })
        .collect();

    let num: Complex64 = poles.iter().map(|&p| -p).product();
    let den: Complex64 = zeros.iter().map(|&z| -z).product();
    let gain = (num / den).re;

    (zeros, poles, gain)
}

/// Elliptic (Cauer): equiripple in both bands.
fn elliptic_prototype(order: usize, rp: f64, rs: f64) -> Zpk {
    let n = order as f64;
    let eps_p = (10f64.powf(rp / 10.0) - 1.0).sqrt();
    let eps_s = (10f64.powf(rs / 10.0) - 1.0).sqrt();
    let k1 = eps_p / eps_s;

    let num_pairs = order / 2;
    let ui: Vec<f64> = (1..=num_pairs).map(|i| (2.0 * i as f64 - 1.0) / n).collect();

    // Degree equation: recover the selectivity modulus from order and k1.
    let k1p = (1.0 - k1 * k1).sqrt();
    let mut kp = k1p.powi(order as i32);
    for &u in &ui {
        kp *= sne(Complex64::new(u, 0.0), k1p).re.powi(4);
    }
    let k = (1.0 - kp * kp).sqrt();

    // Zeros sit on the imaginary axis at the stopband reflection points.
    let mut zeros = Vec::with_capacity(num_pairs * 2);
    for &u in &ui {
        let zeta = cde(Complex64::new(u, 0.0), k).re;
        let z = Complex64::new(0.0, 1.0 / (k * zeta));
        zeros.push(z);
        zeros.push(z.conj());
    }

    // Poles come from the shifted cd argument.
    let j = Complex64::new(0.0, 1.0);
    let v0 = -j * asne(j / eps_p, k1) / n;

    let mut poles = Vec::with_capacity(order);
    for &u in &ui {
        let p = j * cde(Complex64::new(u, 0.0) - j * v0, k);
        poles.push(p);
        poles.push(p.conj());
    }
    if order % 2 == 1 {
        let p0 = j * sne(j * v0, k);
        poles.push(Complex64::new(p0.re, 0.0));
    }

    let num: Complex64 = poles.iter().map(|&p| -p).product();
    let den: Complex64 = zeros.iter().map(|&z| -z).product();
    let mut gain = (num / den).re;
    if order % 2 == 0 {
        gain /= (1.0 + eps_p * eps_p).sqrt();
    }

    (zeros, poles, gain)
}

/// Descending Landen modulus sequence for Jacobi elliptic evaluation.
fn landen(k: f64) -> Vec<f64> {
    let mut sequence = Vec::new();
    let mut k = k;

    for _ in 0..20 {
        if k < 1e-14 {
            break;
        }
        let kp = (1.0 - k * k).sqrt();
        k = (k / (1.0 + kp)).powi(2);
        sequence.push(k);
    }

    sequence
}

/// Jacobi cd with the argument in units of the quarter period K(k).
fn cde(u: Complex64, k: f64) -> Complex64 {
    let moduli = landen(k);
    let mut w = (u * PI / 2.0).cos();

    for &kn in moduli.iter().rev() {
        w = (1.0 + kn) * w / (w * w * kn + 1.0);
    }

    w
}

/// Jacobi sn with the argument in units of the quarter period K(k).
fn sne(u: Complex64, k: f64) -> Complex64 {
    let moduli = landen(k);
    let mut w = (u * PI / 2.0).sin();

    for &kn in moduli.iter().rev() {
        w = (1.0 + kn) * w / (w * w * kn + 1.0);
    }

    w
}

/// Inverse Jacobi sn, normalized to the quarter period.
fn asne(w: Complex64, k: f64) -> Complex64 {
    let mut moduli = vec![k];
    moduli.extend(landen(k));

    let mut v = w;
    for pair in moduli.windows(2) {
        let (k_prev, k_next) = (pair[0], pair[1]);
        let root = (Complex64::new(1.0, 0.0) - v * v * k_prev * k_prev).sqrt();
        v = 2.0 * v / ((1.0 + k_next) * (1.0 + root));
    }

    v.asin() * 2.0 / PI
}

/// Scale the normalized low-pass prototype to the target cutoff.
fn lp_to_lp(zeros: &[Complex64], poles: &[Complex64], gain: f64, wo: f64) -> Zpk {
    let z: Vec<Complex64> = zeros.iter().map(|&z| z * wo).collect();
    let p: Vec<Complex64> = poles.iter().map(|&p| p * wo).collect();
    let k = gain * wo.powi((poles.len() - zeros.len()) as i32);
    (z, p, k)
}

/// Transform the normalized low-pass prototype into a high-pass at `wo`.
fn lp_to_hp(zeros: &[Complex64], poles: &[Complex64], gain: f64, wo: f64) -> Zpk {
    let mut z: Vec<Complex64> = zeros.iter().map(|&z| wo / z).collect();
    let p: Vec<Complex64> = poles.iter().map(|&p| wo / p).collect();

    // The prototype's zeros at infinity move to the origin.
    z.resize(poles.len(), Complex64::new(0.0, 0.0));

    let num: Complex64 = zeros.iter().map(|&z| -z).product();
    let den: Complex64 = poles.iter().map(|&p| -p).product();
    let k = gain * (num / den).re;

    (z, p, k)
}

/// Map the analog design onto the z-plane.
fn bilinear(zeros: &[Complex64], poles: &[Complex64], gain: f64, fs: f64) -> Zpk {
    let fs2 = Complex64::new(2.0 * fs, 0.0);

    let mut z: Vec<Complex64> = zeros.iter().map(|&z| (fs2 + z) / (fs2 - z)).collect();
    let p: Vec<Complex64> = poles.iter().map(|&p| (fs2 + p) / (fs2 - p)).collect();

    // Zeros at analog infinity land at the Nyquist point.
    z.resize(poles.len(), Complex64::new(-1.0, 0.0));

    let num: Complex64 = zeros.iter().map(|&z| fs2 - z).product();
    let den: Complex64 = poles.iter().map(|&p| fs2 - p).product();
    let k = gain * (num / den).re;

    (z, p, k)
}

const CONJ_TOL: f64 = 1e-10;

/// Group roots into conjugate pairs plus leftover reals.
fn group_conjugates(roots: &[Complex64]) -> (Vec<(Complex64, Complex64)>, Vec<Complex64>) {
    let mut positives: Vec<Complex64> = roots.iter().copied().filter(|r| r.im > CONJ_TOL).collect();
    let negatives: Vec<Complex64> = roots.iter().copied().filter(|r| r.im < -CONJ_TOL).collect();
    let reals: Vec<Complex64> = roots
        .iter()
        .copied()
        .filter(|r| r.im.abs() <= CONJ_TOL)
        .collect();

    let mut pairs = Vec::with_capacity(positives.len());

    for neg in negatives {
        // Match each lower-half root with its closest upper-half partner.
        let (index, _) = positives
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                (*a - neg.conj())
                    .norm()
                    .partial_cmp(&(*b - neg.conj()).norm())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("unbalanced conjugate roots");

        let pos = positives.swap_remove(index);
        pairs.push((pos, neg));
    }

    (pairs, reals)
}

/// Expand a root group into monic polynomial coefficients `[1, c1, c2]`.
fn poly_from_group(group: &[Complex64]) -> [f64; 3] {
    match group.len() {
        0 => [1.0, 0.0, 0.0],
        1 => [1.0, -group[0].re, 0.0],
        _ => {
            let sum = group[0] + group[1];
            let product = group[0] * group[1];
            [1.0, -sum.re, product.re]
        }
    }
}

/// Pair zeros with poles into biquad sections; the overall gain is folded
/// into the first section's numerator.
fn zpk_to_sos(zeros: &[Complex64], poles: &[Complex64], gain: f64) -> Vec<Sos> {
    let (pole_pairs, pole_reals) = group_conjugates(poles);
    let (zero_pairs, zero_reals) = group_conjugates(zeros);

    // Pole groups, conjugate pairs first, then reals chunked in twos.
    let mut pole_groups: Vec<Vec<Complex64>> = pole_pairs
        .iter()
        .map(|&(a, b)| vec![a, b])
        .collect();
    for chunk in pole_reals.chunks(2) {
        pole_groups.push(chunk.to_vec());
    }

    // Sort so the section with poles farthest inside the unit circle comes
    // first; the near-unit-circle sections run last.
    pole_groups.sort_by(|a, b| {
        let ra = a.iter().map(|p| p.norm()).fold(0.0, f64::max);
        let rb = b.iter().map(|p| p.norm()).fold(0.0, f64::max);
        ra.partial_cmp(&rb).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut zero_groups: Vec<Vec<Complex64>> = zero_pairs
        .iter()
        .map(|&(a, b)| vec![a, b])
        .collect();
    for chunk in zero_reals.chunks(2) {
        zero_groups.push(chunk.to_vec());
    }

    let mut sections = Vec::with_capacity(pole_groups.len());

    for pole_group in &pole_groups {
        // Take the closest remaining zero group.
        let zero_group = if zero_groups.is_empty() {
            Vec::new()
        } else {
            let anchor = pole_group[0];
            let (index, _) = zero_groups
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    let da = (a[0] - anchor).norm();
                    let db = (b[0] - anchor).norm();
                    da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                })
                .expect("zero group available");
            zero_groups.swap_remove(index)
        };

        sections.push(Sos {
            b: poly_from_group(&zero_group),
            a: poly_from_group(pole_group),
        });
    }

    if let Some(first) = sections.first_mut() {
        for b in first.b.iter_mut() {
            *b *= gain;
        }
    }

    sections
}

/// Stream `input` through the cascade, carrying per-section state in `zi`
/// (two slots per section, direct form II transposed).
pub fn sosfilt(sos: &[Sos], input: &[f64], zi: &mut [[f64; 2]]) -> Vec<f64> {
    debug_assert_eq!(sos.len(), zi.len());
    let mut output = input.to_vec();

    for (section, state) in sos.iter().zip(zi.iter_mut()) {
        for x in output.iter_mut() {
            let input_sample = *x;
            let y = section.b[0] * input_sample + state[0];
            state[0] = section.b[1] * input_sample - section.a[1] * y + state[1];
            state[1] = section.b[2] * input_sample - section.a[2] * y;
            *x = y;
        }
    }

    output
}
