//! 行分隔 JSON 传输：不关心协议，只负责按行读写

use std::string::FromUtf8Error;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 写半边：一帧 = 一行 JSON + '\n'，写完即 flush
pub struct FrameWriter {
    inner: BoxedWriter,
}

impl FrameWriter {
    pub fn new(inner: BoxedWriter) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, frame: &Value) -> std::io::Result<()> {
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await
    }

}

/// 读半边
pub struct FrameReader {
    inner: BufReader<BoxedReader>,
}

impl FrameReader {
    pub fn new(inner: BoxedReader) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// 读下一行；流结束返回 None，非 UTF-8 的行返回 Some(Err)，读取位置已越过该行
    pub async fn next_line(&mut self) -> std::io::Result<Option<Result<String, FromUtf8Error>>> {
        let mut buf = Vec::new();
        let n = self.inner.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        Ok(Some(String::from_utf8(buf)))
    }
}

/// 与工具进程之间的双工通道
pub struct Transport {
    pub reader: FrameReader,
    pub writer: FrameWriter,
}

impl Transport {
    pub fn new(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        }
    }
}
