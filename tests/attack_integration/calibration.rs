//! Calibration aids: the TX square wave and the RX-to-debug loopback.

use canfray::{EncodedFrame, FrameSpec, Injector};

use crate::sim::{SimPlatform, BIT};

#[test]
fn square_wave_toggles_at_the_bit_time_for_160_periods() {
    let mut injector = Injector::new(SimPlatform::new());
    injector.set_timeout(1_000_000);
    assert!(injector.send_square_wave());

    let sim = injector.platform();
    // 160 half-periods starting dominant: 80 dominant pulses of one bit
    // time each
    let spans = sim.dominant_tx_spans();
    assert_eq!(spans.len(), 80);
    for &(start, end) in &spans {
        assert!((end - start).abs_diff(BIT as u64) <= 4, "pulse at {start}");
    }
    assert!(sim.tx_level_now(), "TX released afterwards");
}

#[test]
fn loopback_mirrors_the_bus_onto_the_debug_pin() {
    let mut injector = Injector::new(SimPlatform::new());
    injector.set_timeout(1_000_000);

    let frame =
        EncodedFrame::encode(&FrameSpec::classic(0x123).with_data(&[0xA5])).unwrap();
    let start = 512u64;
    injector
        .platform_mut()
        .remote_bits(&frame, start, frame.tx_bits());
    assert!(injector.loopback(false));

    let sim = injector.platform();
    for i in 0..frame.tx_bits() {
        let mid_bit = start + i as u64 * BIT as u64 + BIT as u64 / 2;
        assert_eq!(sim.debug_level_at(mid_bit), frame.bit(i), "mirrored bit {i}");
    }
}

#[test]
fn loopback_fails_without_a_falling_edge() {
    let mut injector = Injector::new(SimPlatform::new());
    injector.set_timeout(2_000);
    assert!(!injector.loopback(false));
}
