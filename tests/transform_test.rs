mod common;

#[cfg(test)]
mod tests {
    use super::common::{init_tracing, settle, RecordingSink};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;
    use webstreams::{
        PipeOptions, QueuingStrategy, ReadResult, ReadableState, ReadableStream, Result,
        StreamError, TransformStream, TransformStreamController, Transformer, WritableState,
        WritableStream,
    };

    /// Splits a byte stream into lines; the trailing partial line is flushed.
    #[derive(Default)]
    struct LineSplitter {
        pending: String,
    }

    #[async_trait]
    impl Transformer<Bytes, String> for LineSplitter {
        async fn transform(
            &mut self,
            chunk: Bytes,
            controller: &TransformStreamController<String>,
        ) -> Result<()> {
            let text = std::str::from_utf8(&chunk).map_err(StreamError::other)?;
            self.pending.push_str(text);
            while let Some(pos) = self.pending.find('\n') {
                let line: String = self.pending.drain(..=pos).collect();
                controller.enqueue(line.trim_end_matches('\n').to_string())?;
            }
            Ok(())
        }

        async fn flush(&mut self, controller: &TransformStreamController<String>) -> Result<()> {
            if !self.pending.is_empty() {
                controller.enqueue(std::mem::take(&mut self.pending))?;
            }
            Ok(())
        }
    }

    /// Passes chunks through until it sees "stop", then terminates.
    struct StopWord;

    #[async_trait]
    impl Transformer<&'static str, &'static str> for StopWord {
        async fn transform(
            &mut self,
            chunk: &'static str,
            controller: &TransformStreamController<&'static str>,
        ) -> Result<()> {
            if chunk == "stop" {
                controller.terminate();
                return Ok(());
            }
            controller.enqueue(chunk)
        }
    }

    #[tokio::test]
    async fn test_line_splitter_flushes_trailing_line() -> anyhow::Result<()> {
        init_tracing();
        let source = ReadableStream::from_iter(vec![
            Bytes::from_static(b"alpha\nbe"),
            Bytes::from_static(b"ta\n"),
            Bytes::from_static(b"gamma"),
        ]);
        let lines = source.pipe_through(
            TransformStream::new(LineSplitter::default())?,
            PipeOptions::default(),
        )?;

        assert_eq!(lines.collect().await?, vec!["alpha", "beta", "gamma"]);
        assert_eq!(lines.state(), ReadableState::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn test_byte_strategy_on_writable_side() -> anyhow::Result<()> {
        let transform = TransformStream::with_strategies(
            LineSplitter::default(),
            QueuingStrategy::byte_length(16.0)?,
            QueuingStrategy::count(0.0)?,
        )?;
        let writer = transform.writable().get_writer()?;
        settle().await;
        assert_eq!(writer.desired_size()?, Some(16.0));

        let write = writer.write(Bytes::from_static(b"0123456789\n"));
        assert_eq!(writer.desired_size()?, Some(5.0));

        let reader = transform.readable().get_reader()?;
        assert_eq!(reader.read().await?, ReadResult::Chunk("0123456789".to_string()));
        write.await?;
        assert_eq!(writer.desired_size()?, Some(16.0));
        Ok(())
    }

    #[tokio::test]
    async fn test_terminate_closes_readable_and_errors_writable() -> anyhow::Result<()> {
        let transform = TransformStream::new(StopWord)?;
        let writer = transform.writable().get_writer()?;
        let reader = transform.readable().get_reader()?;

        let first = writer.write("go");
        assert_eq!(reader.read().await?, ReadResult::Chunk("go"));
        first.await?;

        let _stop = writer.write("stop");
        assert_eq!(reader.read().await?, ReadResult::Done);
        settle().await;
        assert_eq!(transform.readable().state(), ReadableState::Closed);
        assert_eq!(transform.writable().state(), WritableState::Errored);
        assert!(writer.write("late").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_map_error_aborts_downstream_and_cancels_upstream() -> anyhow::Result<()> {
        init_tracing();
        let source = ReadableStream::from_iter(vec![1u32, 2, 0, 4]);
        let inverted = source.pipe_through(
            TransformStream::map(|n: u32| {
                if n == 0 {
                    Err(StreamError::Range("division by zero".to_string()))
                } else {
                    Ok(100 / n)
                }
            })?,
            PipeOptions::default(),
        )?;

        let (sink, log) = RecordingSink::new();
        let dest = WritableStream::new(sink);
        let err = inverted.pipe_to(&dest, PipeOptions::default()).await.unwrap_err();

        assert!(matches!(err, StreamError::Range(_)));
        assert_eq!(log.writes(), vec!["100", "50"]);
        assert_eq!(dest.state(), WritableState::Errored);
        settle().await;
        assert_eq!(source.state(), ReadableState::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelling_readable_errors_writable() -> anyhow::Result<()> {
        let transform = TransformStream::<u8, u8>::identity()?;
        let writer = transform.writable().get_writer()?;
        settle().await;

        transform
            .readable()
            .cancel(StreamError::reason("reader gone"))
            .await?;
        settle().await;

        assert_eq!(transform.writable().state(), WritableState::Errored);
        let err = writer.write(1).await.unwrap_err();
        assert_eq!(err.to_string(), "reader gone");
        Ok(())
    }

    #[tokio::test]
    async fn test_pipe_through_rejects_locked_source() -> anyhow::Result<()> {
        let source = ReadableStream::from_iter(vec![1u8]);
        let _reader = source.get_reader()?;
        let result = source.pipe_through(TransformStream::identity()?, PipeOptions::default());
        assert!(matches!(result, Err(StreamError::Locked)));
        Ok(())
    }

    #[tokio::test]
    async fn test_writable_abort_reaches_readable_without_a_reader() -> anyhow::Result<()> {
        init_tracing();
        let transform = TransformStream::<u8, u8>::identity()?;
        let writer = transform.writable().get_writer()?;
        settle().await;

        // Held by backpressure: nothing reads the other side.
        let write = writer.write(1);
        settle().await;

        let abort = writer.abort(StreamError::reason("stop"));
        tokio::time::timeout(Duration::from_secs(1), abort).await??;

        assert_eq!(write.await.unwrap_err().to_string(), "stop");
        assert_eq!(transform.writable().state(), WritableState::Errored);
        assert_eq!(transform.readable().state(), ReadableState::Errored);
        let reader = transform.readable().get_reader()?;
        assert_eq!(reader.read().await.unwrap_err().to_string(), "stop");
        Ok(())
    }

    #[tokio::test]
    async fn test_writable_error_reaches_readable() -> anyhow::Result<()> {
        let transform = TransformStream::map(|n: u8| {
            if n == 0 {
                Err(StreamError::reason("zero"))
            } else {
                Ok(n)
            }
        })?;
        let writer = transform.writable().get_writer()?;
        let reader = transform.readable().get_reader()?;
        let read = reader.read();
        settle().await;

        let err = writer.write(0).await.unwrap_err();
        assert_eq!(err.to_string(), "zero");
        assert_eq!(read.await.unwrap_err().to_string(), "zero");
        settle().await;
        assert_eq!(transform.writable().state(), WritableState::Errored);
        assert_eq!(transform.readable().state(), ReadableState::Errored);
        Ok(())
    }
}
