use async_trait::async_trait;
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use webstreams::{
    PipeOptions, QueuingStrategy, ReadableStream, Result, TransformStream, UnderlyingSink,
    WritableStream, WritableStreamController,
};

/// Counts bytes and drops them.
struct NullSink {
    bytes: usize,
}

#[async_trait]
impl UnderlyingSink<Bytes> for NullSink {
    async fn write(&mut self, chunk: Bytes, _controller: &WritableStreamController<Bytes>) -> Result<()> {
        self.bytes += chunk.len();
        Ok(())
    }
}

fn chunks(count: usize, size: usize) -> Vec<Bytes> {
    let chunk = Bytes::from(vec![0xAB; size]);
    (0..count).map(|_| chunk.clone()).collect()
}

fn bench_pipe_to(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("pipe_to");
    for count in [100usize, 1000, 10_000].iter() {
        let input = chunks(*count, 1024);
        group.throughput(Throughput::Bytes((*count * 1024) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &input, |b, input| {
            b.iter(|| {
                runtime.block_on(async {
                    let source = ReadableStream::from_iter(input.clone());
                    let dest = WritableStream::with_strategy(
                        NullSink { bytes: 0 },
                        QueuingStrategy::byte_length(16.0 * 1024.0).unwrap(),
                    );
                    source
                        .pipe_to(black_box(&dest), PipeOptions::default())
                        .await
                        .unwrap();
                })
            });
        });
    }
    group.finish();
}

fn bench_pipe_through_identity(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("pipe_through_identity");
    for count in [100usize, 1000].iter() {
        let input = chunks(*count, 1024);
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &input, |b, input| {
            b.iter(|| {
                runtime.block_on(async {
                    let source = ReadableStream::from_iter(input.clone());
                    let out = source
                        .pipe_through(TransformStream::identity().unwrap(), PipeOptions::default())
                        .unwrap();
                    black_box(out.concat_bytes().await.unwrap())
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pipe_to, bench_pipe_through_identity);
criterion_main!(benches);
