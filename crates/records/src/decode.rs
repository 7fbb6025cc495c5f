//! 记录键还原为驱动命令
//!
//! 键由15个 `-` 分隔的字段组成，按位置对应卷积配置参数：
//!
//! ```text
//! 0 c | 1 H | 2 W | 3 y x x | 4 k | 5 输出高 | 6 输出宽 | 7 n
//! 8 p x q | 9 v x u | 10 j x l | 11 b | 12 布局 | 13 精度 | 14 方向
//! ```
//!
//! 输出高宽和布局不对应命令参数，直接跳过。

use tuna_core::{TunaError, TunaResult};

pub const DRIVER: &str = "MIOpenDriver";
const FIELD_COUNT: usize = 15;

fn invalid(key: &str, message: impl Into<String>) -> TunaError {
    TunaError::InvalidKey {
        key: key.to_string(),
        message: message.into(),
    }
}

struct Fields<'a> {
    key: &'a str,
    parts: Vec<&'a str>,
}

impl<'a> Fields<'a> {
    fn int(&self, index: usize) -> TunaResult<i64> {
        let part = self.parts[index];
        part.parse()
            .map_err(|_| invalid(self.key, format!("第{index}个字段不是整数: {part}")))
    }

    /// `AxB` 形式的复合字段
    fn pair(&self, index: usize) -> TunaResult<(i64, i64)> {
        let part = self.parts[index];
        let parse = |s: &str| {
            s.parse::<i64>()
                .map_err(|_| invalid(self.key, format!("第{index}个字段不是 AxB 形式: {part}")))
        };
        let (a, b) = part
            .split_once('x')
            .ok_or_else(|| invalid(self.key, format!("第{index}个字段不是 AxB 形式: {part}")))?;
        Ok((parse(a)?, parse(b)?))
    }

    fn text(&self, index: usize) -> &'a str {
        self.parts[index]
    }
}

fn subcommand(key: &str, precision: &str) -> TunaResult<&'static str> {
    match precision {
        "FP32" => Ok("conv"),
        "FP16" => Ok("convfp16"),
        "BF16" => Ok("convbfp16"),
        other => Err(invalid(key, format!("未知的数据类型: {other}"))),
    }
}

fn direction(key: &str, direction: &str) -> TunaResult<u8> {
    match direction {
        "F" => Ok(1),
        "B" => Ok(2),
        "W" => Ok(4),
        other => Err(invalid(key, format!("未知的方向: {other}"))),
    }
}

/// 还原驱动参数，不含驱动名和子命令
pub fn driver_options(key: &str) -> TunaResult<String> {
    let fields = Fields {
        key,
        parts: key.split('-').collect(),
    };
    if fields.parts.len() != FIELD_COUNT {
        return Err(invalid(
            key,
            format!("字段数应为 {FIELD_COUNT}，实际为 {}", fields.parts.len()),
        ));
    }

    let (kernel_h, kernel_w) = fields.pair(3)?;
    let (pad_h, pad_w) = fields.pair(8)?;
    let (stride_h, stride_w) = fields.pair(9)?;
    let (dilation_h, dilation_w) = fields.pair(10)?;

    Ok(format!(
        "-c {} -H {} -W {} -x {} -y {} -k {} -n {} -p {} -q {} -u {} -v {} -l {} -j {} -b {} -F {}",
        fields.int(0)?,
        fields.int(1)?,
        fields.int(2)?,
        kernel_w,
        kernel_h,
        fields.int(4)?,
        fields.int(7)?,
        pad_h,
        pad_w,
        stride_w,
        stride_h,
        dilation_w,
        dilation_h,
        fields.int(11)?,
        direction(key, fields.text(14))?,
    ))
}

/// 可直接执行的复现命令
pub fn driver_command(key: &str) -> TunaResult<String> {
    let precision = key
        .rsplit('-')
        .nth(1)
        .ok_or_else(|| invalid(key, "缺少精度字段"))?;
    let options = driver_options(key)?;
    Ok(format!("{DRIVER} {} {options}", subcommand(key, precision)?))
}
