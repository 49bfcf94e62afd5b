use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use burn::tensor::{Bool, Tensor, TensorData, backend::Backend};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SeparationError};

/// Headers larger than this are rejected as corrupt.
const MAX_HEADER_LEN: u64 = 1 << 20;

/// Payloads larger than this are rejected as corrupt.
const MAX_PAYLOAD_LEN: u64 = 1 << 32;

/// Element type of a stored array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float32,
    Bool,
}

impl DType {
    fn element_size(&self) -> usize {
        match self {
            DType::Float32 => 4,
            DType::Bool => 1,
        }
    }
}

/// Row-major array values.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Float(Vec<f32>),
    Bool(Vec<bool>),
}

impl ArrayData {
    pub fn len(&self) -> usize {
        match self {
            ArrayData::Float(values) => values.len(),
            ArrayData::Bool(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            ArrayData::Float(_) => DType::Float32,
            ArrayData::Bool(_) => DType::Bool,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordHeader {
    name: String,
    dtype: DType,
    shape: Vec<usize>,
}

/// A named array with its shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayRecord {
    name: String,
    shape: Vec<usize>,
    data: ArrayData,
}

impl ArrayRecord {
    /// Fails when the number of values does not match the shape.
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: ArrayData) -> Result<Self> {
        let name = name.into();
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(SeparationError::shape(
                format!("array `{name}`"),
                format!("{expected} values for shape {shape:?}"),
                format!("{} values", data.len()),
            ));
        }
        Ok(Self { name, shape, data })
    }

    pub fn float(name: impl Into<String>, shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        Self::new(name, shape, ArrayData::Float(values))
    }

    pub fn bool(name: impl Into<String>, shape: Vec<usize>, values: Vec<bool>) -> Result<Self> {
        Self::new(name, shape, ArrayData::Bool(values))
    }

    /// Stores a feature matrix.
    pub fn from_array2(name: impl Into<String>, array: &Array2<f32>) -> Result<Self> {
        let (rows, cols) = array.dim();
        Self::float(name, vec![rows, cols], array.iter().copied().collect())
    }

    pub fn from_tensor<B: Backend, const D: usize>(
        name: impl Into<String>,
        tensor: Tensor<B, D>,
    ) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let values = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| SeparationError::TensorData {
                message: format!("{e:?}"),
            })?;
        Self::float(name, shape, values)
    }

    pub fn from_bool_tensor<B: Backend, const D: usize>(
        name: impl Into<String>,
        tensor: Tensor<B, D, Bool>,
    ) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let values = tensor
            .into_data()
            .to_vec::<bool>()
            .map_err(|e| SeparationError::TensorData {
                message: format!("{e:?}"),
            })?;
        Self::bool(name, shape, values)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if self.shape.len() != rank {
            return Err(SeparationError::shape(
                format!("array `{}`", self.name),
                format!("rank {rank}"),
                format!("shape {:?}", self.shape),
            ));
        }
        Ok(())
    }

    fn wrong_dtype(&self, expected: DType) -> SeparationError {
        SeparationError::TensorData {
            message: format!(
                "array `{}` holds {:?} values, not {:?}",
                self.name,
                self.dtype(),
                expected
            ),
        }
    }

    pub fn to_array2(&self) -> Result<Array2<f32>> {
        self.check_rank(2)?;
        let ArrayData::Float(values) = &self.data else {
            return Err(self.wrong_dtype(DType::Float32));
        };
        Array2::from_shape_vec((self.shape[0], self.shape[1]), values.clone()).map_err(|e| {
            SeparationError::TensorData {
                message: e.to_string(),
            }
        })
    }

    pub fn to_tensor<B: Backend, const D: usize>(&self, device: &B::Device) -> Result<Tensor<B, D>> {
        self.check_rank(D)?;
        let ArrayData::Float(values) = &self.data else {
            return Err(self.wrong_dtype(DType::Float32));
        };
        Ok(Tensor::from_data(
            TensorData::new(values.clone(), self.shape.clone()),
            device,
        ))
    }

    pub fn to_bool_tensor<B: Backend, const D: usize>(
        &self,
        device: &B::Device,
    ) -> Result<Tensor<B, D, Bool>> {
        self.check_rank(D)?;
        let ArrayData::Bool(values) = &self.data else {
            return Err(self.wrong_dtype(DType::Bool));
        };
        Ok(Tensor::from_data(
            TensorData::new(values.clone(), self.shape.clone()),
            device,
        ))
    }
}

/// Writes array records to a byte sink.
pub struct ArrayRecordWriter<W: Write> {
    inner: W,
    records: usize,
}

impl ArrayRecordWriter<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        log::debug!("writing array records to {}", path.as_ref().display());
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> ArrayRecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, records: 0 }
    }

    /// Number of records written so far.
    pub fn records(&self) -> usize {
        self.records
    }

    pub fn write(&mut self, record: &ArrayRecord) -> Result<()> {
        let header = serde_json::to_vec(&RecordHeader {
            name: record.name.clone(),
            dtype: record.dtype(),
            shape: record.shape.clone(),
        })?;
        self.inner.write_all(&(header.len() as u64).to_le_bytes())?;
        self.inner.write_all(&header)?;

        let payload: Vec<u8> = match &record.data {
            ArrayData::Float(values) => values.iter().flat_map(|value| value.to_le_bytes()).collect(),
            ArrayData::Bool(values) => values.iter().map(|&value| u8::from(value)).collect(),
        };
        self.inner.write_all(&payload)?;
        self.records += 1;
        log::trace!("wrote array `{}` with shape {:?}", record.name, record.shape);
        Ok(())
    }

    pub fn write_float(&mut self, name: &str, shape: Vec<usize>, values: Vec<f32>) -> Result<()> {
        self.write(&ArrayRecord::float(name, shape, values)?)
    }

    pub fn write_bool(&mut self, name: &str, shape: Vec<usize>, values: Vec<bool>) -> Result<()> {
        self.write(&ArrayRecord::bool(name, shape, values)?)
    }

    /// Flushes and returns the sink.
    pub fn finish(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

fn invalid_data(message: String) -> SeparationError {
    SeparationError::Io(io::Error::new(io::ErrorKind::InvalidData, message))
}

/// Reads back records written by [`ArrayRecordWriter`].
pub struct ArrayRecordReader<R: Read> {
    inner: R,
}

impl ArrayRecordReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: Read> ArrayRecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads the header length, or `None` at a clean end of stream.
    fn read_header_len(&mut self) -> Result<Option<u64>> {
        let mut buf = [0u8; 8];
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(read) => filled += read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(u64::from_le_bytes(buf)))
    }

    /// Next record, or `None` when the stream is exhausted.
    pub fn read_record(&mut self) -> Result<Option<ArrayRecord>> {
        let Some(header_len) = self.read_header_len()? else {
            return Ok(None);
        };
        if header_len > MAX_HEADER_LEN {
            return Err(invalid_data(format!(
                "header of {header_len} bytes exceeds {MAX_HEADER_LEN}"
            )));
        }

        let mut header = vec![0u8; header_len as usize];
        self.inner.read_exact(&mut header)?;
        let header: RecordHeader = serde_json::from_slice(&header)?;

        let payload_len = header
            .shape
            .iter()
            .try_fold(header.dtype.element_size(), |len, &dim| len.checked_mul(dim))
            .and_then(|len| u64::try_from(len).ok())
            .filter(|&len| len <= MAX_PAYLOAD_LEN)
            .ok_or_else(|| {
                invalid_data(format!(
                    "array `{}` of shape {:?} exceeds {MAX_PAYLOAD_LEN} bytes",
                    header.name, header.shape
                ))
            })?;
        let mut payload = Vec::new();
        (&mut self.inner).take(payload_len).read_to_end(&mut payload)?;
        if payload.len() as u64 != payload_len {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }

        let data = match header.dtype {
            DType::Float32 => ArrayData::Float(
                payload
                    .chunks_exact(4)
                    .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
                    .collect(),
            ),
            DType::Bool => ArrayData::Bool(
                payload
                    .iter()
                    .map(|&byte| match byte {
                        0 => Ok(false),
                        1 => Ok(true),
                        other => Err(invalid_data(format!("invalid bool byte {other}"))),
                    })
                    .collect::<Result<_>>()?,
            ),
        };
        ArrayRecord::new(header.name, header.shape, data).map(Some)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Iterator for ArrayRecordReader<R> {
    type Item = Result<ArrayRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_record().transpose()
    }
}
