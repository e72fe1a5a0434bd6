//! Codec benchmarks for sideline-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use sideline_protocol::{
    codec, EmergencyAlertData, EmergencyResponse, Identity, Inbound, Outbound, ResponderStatus,
    Role,
};

fn alert_frame() -> String {
    let mut data = EmergencyAlertData::new("emergency_1714572202512", "42", "Mike Chen");
    data.timestamp = Some("2024-05-01T14:03:22.512341".into());
    data.vital_signs.heart_rate = Some(180.0);
    data.vital_signs.blood_pressure = Some("160/100".into());
    codec::encode_inbound(&Inbound::alert(data)).unwrap()
}

fn bench_decode_alert(c: &mut Criterion) {
    let encoded = alert_frame();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("emergency_alert", |b| {
        b.iter(|| codec::decode_inbound(black_box(&encoded)))
    });
    group.finish();
}

fn bench_encode_response(c: &mut Criterion) {
    let identity = Identity::new("7", Role::Coach);
    let event = Outbound::from(
        EmergencyResponse::new("emergency_1714572202512", &identity, ResponderStatus::Responding)
            .with_eta(Some(3)),
    );

    let mut group = c.benchmark_group("encode");
    group.bench_function("emergency_response", |b| {
        b.iter(|| codec::encode_outbound(black_box(&event)))
    });
    group.finish();
}

criterion_group!(benches, bench_decode_alert, bench_encode_response);
criterion_main!(benches);
