use crate::{ProjectionPlanes, SynthesisParams, Waveform, sample_count};

pub fn dc_value(sample_rate: f64, sweep_time: f64, amplitude: f64) -> Waveform {
    Waveform::new(
        sample_rate,
        vec![amplitude; sample_count(sample_rate, sweep_time)],
    )
}

/// Sawtooth for the remote-focus axis.
///
/// Holds at `offset - amplitude` for the delay, rises to `offset + amplitude`
/// over the exposure, falls back over the falling fraction and holds low for
/// whatever is left of the sweep. Segments that do not fit in the sweep are
/// shortened in the order rise, fall, delay.
pub fn remote_focus_ramp(params: &SynthesisParams, offset: f64) -> Waveform {
    let total = sample_count(params.sample_rate, params.sweep_time);
    let per_exposure = params.sample_rate * params.exposure_time;

    let delay = samples_for(per_exposure * params.delay_percent / 100.0).min(total);
    let fall = samples_for(per_exposure * params.falling_percent / 100.0).min(total - delay);
    let rise = samples_for(per_exposure).min(total - delay - fall);
    let settle = total - delay - rise - fall;

    let low = offset - params.amplitude;
    let high = offset + params.amplitude;

    let mut values = Vec::with_capacity(total);
    values.extend(std::iter::repeat_n(low, delay));
    values.extend(linspace(low, high, rise));
    values.extend(linspace(high, low, fall));
    values.extend(std::iter::repeat_n(low, settle));

    Waveform::new(params.sample_rate, values)
}

/// One ramp per plane, each around its own interpolated offset.
pub fn projection(params: &SynthesisParams, planes: &ProjectionPlanes) -> Waveform {
    let segments = planes
        .offsets()
        .into_iter()
        .map(|offset| remote_focus_ramp(params, offset))
        .collect();

    Waveform::concat(params.sample_rate, segments)
}

fn samples_for(samples: f64) -> usize {
    samples.round().max(0.0) as usize
}

fn linspace(start: f64, end: f64, count: usize) -> impl Iterator<Item = f64> {
    let step = if count > 1 {
        (end - start) / (count - 1) as f64
    } else {
        0.0
    };
    (0..count).map(move |i| start + step * i as f64)
}
