use std::io::{self, Write};

use log::debug;

/// 1行を上書きし続けるステータス表示。
///
/// 直前に表示したメッセージの長さを自身で保持し、空白で消してから
/// 新しいメッセージを`\r`付きで書き込む。詳細な診断はlogに出力し、
/// この行は最新の状態だけを示す。
pub struct StatusLine<W: Write> {
    writer: W,
    last_len: usize,
}

impl<W: Write> StatusLine<W> {
    /// 新しい`StatusLine`を返す。
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            last_len: 0,
        }
    }

    /// 直前のメッセージを消して新しいメッセージを表示する。
    ///
    /// ステータス行は補助的な表示のため、書き込みの失敗でwatcherを
    /// 止めない。失敗はlogに残して続行する。
    pub fn update(&mut self, message: &str) {
        if let Err(err) = self.write(message) {
            debug!("Failed to update status line: {}", err);
            return;
        }
        self.last_len = message.chars().count();
    }

    fn write(&mut self, message: &str) -> io::Result<()> {
        write!(self.writer, "{}\r", " ".repeat(self.last_len))?;
        write!(self.writer, "{}\r", message)?;
        self.writer.flush()
    }
}
