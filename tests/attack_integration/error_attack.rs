//! Error-frame injection: the active error flag after an identifier
//! match and the repeated delimiter destruction.

use canfray::{FrameSlot, FrameSpec, Injector};

use crate::sim::{SimPlatform, BIT};

fn armed_injector(spec: &FrameSpec) -> Injector<SimPlatform> {
    let mut injector = Injector::new(SimPlatform::new());
    injector.set_timeout(10_000_000);
    injector.set_frame(FrameSlot::First, spec).unwrap();
    injector.set_attack_masks().unwrap();
    injector
}

#[test]
fn injects_a_six_bit_error_flag_then_destroys_the_delimiter() {
    let spec = FrameSpec::classic(0x123).with_data(&[0xA5]);
    let mut injector = armed_injector(&spec);
    let frame = injector.frame(FrameSlot::First).unwrap().clone();
    let match_bits = injector.attack_masks().unwrap().n_frame_match_bits as u64;

    let victim_start = 1_504u64;
    injector
        .platform_mut()
        .remote_bits(&frame, victim_start, match_bits as usize);

    // Template: one dominant bit followed by seven recessive, the shape
    // of a delimiter boundary on the recovering bus
    assert!(injector.error_attack(1, true, 0xFF, 0x7F));

    let sim = injector.platform();
    let spans = sim.dominant_tx_spans();
    assert_eq!(spans.len(), 2, "error flag plus one destruction pulse");

    // Active error flag: six bit times starting at the bit boundary
    // right after the matched identifier
    let (flag_start, flag_end) = spans[0];
    let match_boundary = victim_start + match_bits * BIT as u64;
    assert!(flag_start.abs_diff(match_boundary) <= 4, "flag at {flag_start}");
    assert!((flag_end - flag_start).abs_diff(6 * BIT as u64) <= 4);

    // Destruction pulse: seven bit times, after the flag was released
    let (pulse_start, pulse_end) = spans[1];
    assert!(pulse_start > flag_end);
    assert!((pulse_end - pulse_start).abs_diff(7 * BIT as u64) <= 4);

    assert!(injector.platform().tx_level_now(), "TX released at the end");
}

#[test]
fn repeat_count_drives_one_pulse_per_template_match() {
    let spec = FrameSpec::classic(0x123).with_data(&[0xA5]);
    let mut injector = armed_injector(&spec);
    let frame = injector.frame(FrameSlot::First).unwrap().clone();
    let match_bits = injector.attack_masks().unwrap().n_frame_match_bits as u64;

    injector
        .platform_mut()
        .remote_bits(&frame, 1_504, match_bits as usize);

    // No error flag, three destruction rounds; the idle bus re-matches
    // the template after each pulse
    assert!(injector.error_attack(3, false, 0xFF, 0x7F));

    let sim = injector.platform();
    let spans = sim.dominant_tx_spans();
    assert_eq!(spans.len(), 3);
    for &(start, end) in &spans {
        assert!((end - start).abs_diff(7 * BIT as u64) <= 4, "pulse at {start}");
    }
}

#[test]
fn error_attack_times_out_without_a_match() {
    let spec = FrameSpec::classic(0x123).with_data(&[0xA5]);
    let mut injector = armed_injector(&spec);
    injector.set_timeout(5_000);
    assert!(!injector.error_attack(1, true, 0xFF, 0x7F));
    assert!(injector.platform().tx_level_now());
}
