mod common;

#[cfg(test)]
mod tests {
    use super::common::{init_tracing, settle, ManualSource, RecordingSink};
    use bytes::Bytes;
    use webstreams::{
        PipeOptions, ReadResult, ReadableState, ReadableStream, StreamError, TransformStream,
        WritableStream,
    };

    #[tokio::test]
    async fn test_tee_feeds_a_pipe_and_a_collector() -> anyhow::Result<()> {
        init_tracing();
        let source = ReadableStream::from_iter(vec!["a", "b", "c"]);
        let (left, right) = source.tee()?;
        assert!(source.locked());

        let (sink, log) = RecordingSink::new();
        let dest = WritableStream::new(sink);
        let (piped, collected) = tokio::join!(
            left.pipe_to(&dest, PipeOptions::default()),
            right.collect()
        );
        piped?;

        assert_eq!(log.writes(), vec!["a", "b", "c"]);
        assert_eq!(collected?, vec!["a", "b", "c"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_tee_of_a_tee() -> anyhow::Result<()> {
        let source = ReadableStream::from_iter(1..=4);
        let (left, right) = source.tee()?;
        let (right_a, right_b) = right.tee()?;

        let (l, a, b) = tokio::join!(left.collect(), right_a.collect(), right_b.collect());
        assert_eq!(l?, vec![1, 2, 3, 4]);
        assert_eq!(a?, vec![1, 2, 3, 4]);
        assert_eq!(b?, vec![1, 2, 3, 4]);
        Ok(())
    }

    #[tokio::test]
    async fn test_tee_locked_source_is_rejected() -> anyhow::Result<()> {
        let source = ReadableStream::from_iter(vec![1u8]);
        let _reader = source.get_reader()?;
        assert!(matches!(source.tee(), Err(StreamError::Locked)));
        Ok(())
    }

    #[tokio::test]
    async fn test_branches_through_different_transforms() -> anyhow::Result<()> {
        let source = ReadableStream::from_iter(vec![
            Bytes::from_static(b"ab"),
            Bytes::from_static(b"cde"),
        ]);
        let (left, right) = source.tee()?;
        let lengths = left.pipe_through(
            TransformStream::map(|b: Bytes| Ok(b.len()))?,
            PipeOptions::default(),
        )?;

        let (lengths, joined) = tokio::join!(lengths.collect(), right.concat_bytes());
        assert_eq!(lengths?, vec![2, 3]);
        assert_eq!(joined?, Bytes::from_static(b"abcde"));
        Ok(())
    }

    #[tokio::test]
    async fn test_source_error_after_partial_read() -> anyhow::Result<()> {
        let (source, handle) = ManualSource::<u16>::new();
        let source = ReadableStream::new(source);
        settle().await;
        let (left, right) = source.tee()?;

        let left_reader = left.get_reader()?;
        let first = left_reader.read();
        handle.controller().enqueue(7)?;
        assert_eq!(first.await?, ReadResult::Chunk(7));

        handle.controller().error(StreamError::reason("upstream lost"));
        settle().await;

        assert_eq!(left.state(), ReadableState::Errored);
        assert_eq!(right.state(), ReadableState::Errored);
        let err = left_reader.read().await.unwrap_err();
        assert_eq!(err.to_string(), "upstream lost");
        Ok(())
    }
}
