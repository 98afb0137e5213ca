use std::sync::Arc;

use super::unpack;
use crate::{
    block::Block,
    num::{DataType, One, Scalar, Zero, dispatch},
    runtime::{Execute, Kernel, KernelError, Value},
    shape::Shape,
};

/// A block of `shape` with every element set to `value`.
#[derive(Debug, Clone, Kernel)]
#[kernel(crate = "crate")]
pub struct Fill {
    pub shape: Shape,
    pub r#type: DataType,
    pub value: f64,
}

impl Execute for Fill {
    fn execute(&self, args: Vec<Value>) -> Result<Value, KernelError> {
        let [] = unpack::<0>(self, args)?;
        Ok(Block::full_as(self.shape.clone(), self.r#type, self.value).into())
    }
}

/// The 1-d block of elements `start + (offset + i) * step` for `i` in `0..len`.
#[derive(Debug, Clone, Kernel)]
#[kernel(crate = "crate")]
pub struct Arange {
    pub start: f64,
    pub step: f64,
    pub offset: usize,
    pub len: usize,
    pub r#type: DataType,
}

impl Execute for Arange {
    fn execute(&self, args: Vec<Value>) -> Result<Value, KernelError> {
        let [] = unpack::<0>(self, args)?;
        let values = (0..self.len).map(|i| self.start + (self.offset + i) as f64 * self.step);
        let block = dispatch!(self.r#type, T => {
            let data: Vec<T> = values.map(T::from_f64).collect();
            Block::from_vec([self.len], data)?
        });
        Ok(block.into())
    }
}

/// One 2-d block of an identity-like matrix. Ones sit where the global row equals the global column.
#[derive(Debug, Clone, Kernel)]
#[kernel(crate = "crate")]
pub struct Eye {
    pub shape: Shape,
    pub offset: Vec<usize>,
    pub r#type: DataType,
}

impl Execute for Eye {
    fn execute(&self, args: Vec<Value>) -> Result<Value, KernelError> {
        let [] = unpack::<0>(self, args)?;
        let (&[rows, cols], &[row, col]) = (self.shape.as_slice(), self.offset.as_slice()) else {
            return Err(KernelError::Argument("eye blocks are 2-d".into()));
        };
        let block = dispatch!(self.r#type, T => {
            let mut data = vec![T::zero(); rows * cols];
            for i in 0..rows {
                let j = (row + i).wrapping_sub(col);
                if j < cols {
                    data[i * cols + j] = T::one();
                }
            }
            Block::from_vec([rows, cols], data)?
        });
        Ok(block.into())
    }
}

/// Parses a chunk of delimited text into a 2-d block with one row per data line.
///
/// Blank lines and `#` comments are skipped. `first_line` numbers the chunk's first line in errors.
#[derive(Debug, Clone, Kernel)]
#[kernel(crate = "crate", name = "loadtxt")]
pub struct ParseText {
    pub text: Arc<str>,
    pub delimiter: Option<char>,
    pub r#type: DataType,
    pub first_line: usize,
}

impl ParseText {
    fn fields<'a>(&self, line: &'a str) -> Vec<&'a str> {
        match self.delimiter {
            Some(delimiter) => line.split(delimiter).map(str::trim).collect(),
            None => line.split_whitespace().collect(),
        }
    }

    fn parse<T: Scalar>(&self, field: &str) -> Result<T, String> {
        match self.r#type {
            DataType::Bool => match field.to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(T::from_i64(1)),
                "false" | "0" => Ok(T::from_i64(0)),
                _ => Err(format!("`{field}` is not a boolean")),
            },
            r#type if r#type.is_integer() => field
                .parse::<i64>()
                .map(T::from_i64)
                .map_err(|err| format!("`{field}` is not an integer: {err}")),
            _ => field
                .parse::<f64>()
                .map(T::from_f64)
                .map_err(|err| format!("`{field}` is not a number: {err}")),
        }
    }

    fn rows<T: Scalar>(&self) -> Result<Block, KernelError> {
        let mut data: Vec<T> = vec![];
        let mut rows = 0;
        let mut cols = None;
        for (index, line) in self.text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let line_number = self.first_line + index;
            let fields = self.fields(line);
            match cols {
                Some(cols) if cols != fields.len() => {
                    return Err(KernelError::Parse {
                        line: line_number,
                        message: format!("expected {cols} columns, found {}", fields.len()),
                    });
                }
                _ => cols = Some(fields.len()),
            }
            for field in fields {
                let value = self.parse::<T>(field).map_err(|message| KernelError::Parse {
                    line: line_number,
                    message,
                })?;
                data.push(value);
            }
            rows += 1;
        }
        Block::from_vec([rows, cols.unwrap_or(0)], data)
    }
}

impl Execute for ParseText {
    fn execute(&self, args: Vec<Value>) -> Result<Value, KernelError> {
        let [] = unpack::<0>(self, args)?;
        dispatch!(self.r#type, T => self.rows::<T>()).map(Value::Block)
    }
}
