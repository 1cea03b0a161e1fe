use std::time::Instant;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use mcdash::{
    codec::{self, decode_varint, encode_packet, encode_string, encode_varint},
    processing::parse_status_response,
    session::status::{Progress, StatusSession},
};
use rand::Rng;

const STATUS_JSON: &str = r#"{"version":{"name":"Paper 1.21.1","protocol":767},"players":{"max":100,"online":3,"sample":[{"name":"Alice","id":"4566e69f-c907-48ee-8d71-d7ba5aa00d20"},{"name":"Bob","id":"069a79f4-44e9-4726-a5be-fca90e38aaf5"}]},"description":{"text":"A ","extra":[{"text":"Minecraft","color":"green"},{"text":" server"}]},"forgeData":{"mods":[{"modId":"forge","modmarker":"47.2.0"},{"modId":"jei","modmarker":"15.3.0"}]}}"#;

/// Feed a whole status exchange through a session, `chunk_size` bytes at a
/// time.
fn run_session(response: &[u8], chunk_size: usize) -> Progress {
    let mut session = StatusSession::new("play.example.com", 25565, 767);
    session.on_connect();

    let mut progress = Progress::NeedMoreData;
    for chunk in response.chunks(chunk_size) {
        session.receive(chunk);
        progress = session.advance(Instant::now()).unwrap();
    }
    let mut pong = Vec::new();
    if let Progress::SendPing(_) = progress {
        pong = encode_packet(0x01, &session.ping_payload());
    }
    session.receive(&pong);
    session.advance(Instant::now()).unwrap()
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut rng = rand::thread_rng();
    let varints = (0..1024)
        .map(|_| encode_varint(rng.gen_range(0..u32::MAX)))
        .collect::<Vec<_>>();
    c.bench_function("decode_varint", |b| {
        b.iter(|| {
            for varint in &varints {
                black_box(decode_varint(black_box(varint), 0).unwrap());
            }
        })
    });

    let response = encode_packet(0x00, &encode_string(STATUS_JSON));
    c.bench_function("read_packet", |b| {
        b.iter(|| codec::read_packet(black_box(&response)).unwrap())
    });

    c.bench_function("parse_status_response", |b| {
        b.iter(|| parse_status_response(black_box(STATUS_JSON)).unwrap())
    });

    c.bench_function("status_session_whole", |b| {
        b.iter(|| run_session(black_box(&response), response.len()))
    });
    c.bench_function("status_session_chunked", |b| {
        b.iter(|| run_session(black_box(&response), 16))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
