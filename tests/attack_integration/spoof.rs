//! Targeted spoofing: identifier-match triggering, next-window transmit
//! and the error-passive in-place overwrite.

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
fn spoof_transmits_after_the_target_identifier_passes() {
    let spec = FrameSpec::classic(0x123).with_data(&[0xA5]);
    let mut injector = armed_injector(&spec);
    let frame = injector.frame(FrameSlot::First).unwrap().clone();
    let match_bits = injector.attack_masks().unwrap().n_frame_match_bits as u64;

    // The victim transmits our target identifier
    let victim_start = 2_000u64;
    injector
        .platform_mut()
        .remote_bits(&frame, victim_start, match_bits as usize);
    assert!(injector.spoof_frame(0));

    let sim = injector.platform();
    let sof = sim.first_dominant_tx().unwrap();
    // The spoof waits out the victim prefix plus a fresh idle window
    assert!(sof >= victim_start + (match_bits + 10) * BIT as u64, "SOF at {sof}");
    for i in 0..frame.tx_bits() {
        let mid_bit = sof + i as u64 * BIT as u64 + BIT as u64 / 2;
        assert_eq!(sim.bus_level_at(mid_bit), frame.bit(i), "wire bit {i}");
    }
}

#[test]
fn error_passive_spoof_overwrites_the_target_in_place() {
    let spec = FrameSpec::classic(0x123).with_data(&[0xA5]);
    let mut injector = armed_injector(&spec);
    let frame = injector.frame(FrameSlot::First).unwrap().clone();
    let match_bits = injector.attack_masks().unwrap().n_frame_match_bits as u64;

    // The victim transmits the whole frame; we overwrite from the end
    // of the identifier, in lockstep with the same bit values
    let victim_start = 2_000u64;
    injector
        .platform_mut()
        .remote_bits(&frame, victim_start, frame.tx_bits());
    assert!(injector.spoof_frame_error_passive(0));

    let sim = injector.platform();
    // Nothing driven during the matched prefix
    let first = sim.first_dominant_tx().unwrap();
    assert!(first >= victim_start + match_bits * BIT as u64);
    assert!(first < victim_start + (match_bits + 2) * BIT as u64);
    // The ACK slot is ours, driven dominant in the victim's own slot
    // timing
    let ack_index = frame.last_crc_bit() as u64 + 2;
    let ack_mid = victim_start + ack_index * BIT as u64 + BIT as u64 / 2;
    assert!(!sim.tx_level_at(ack_mid), "self-driven ACK");
    assert!(sim.tx_level_now(), "TX released after EOF");
}

#[test]
fn primitives_without_masks_fail_fast() {
    let spec = FrameSpec::classic(0x123).with_data(&[0xA5]);
    let mut injector = Injector::new(SimPlatform::new());
    injector.set_timeout(1_000_000);
    injector.set_frame(FrameSlot::First, &spec).unwrap();

    // No masks derived yet
    assert!(!injector.spoof_frame(0));
    assert!(!injector.spoof_frame_error_passive(0));
    assert!(!injector.error_attack(1, true, 0xFF, 0x7F));

    // Re-loading frame 1 invalidates masks derived before it
    injector.set_attack_masks().unwrap();
    injector
        .set_frame(FrameSlot::First, &FrameSpec::classic(0x124))
        .unwrap();
    assert!(!injector.spoof_frame(0));
}

#[test]
fn spoof_times_out_when_the_target_never_appears() {
    let spec = FrameSpec::classic(0x123).with_data(&[0xA5]);
    let mut injector = armed_injector(&spec);
    injector.set_timeout(5_000);
    assert!(!injector.spoof_frame(0));
    assert!(injector.platform().tx_level_now());
}
