// CAN 设备驱动 (socketcan)
// CAN 总线通信模块，提供模块链路上的收发接口

use socketcan::{CanDataFrame, CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket, StandardId};
use std::collections::HashSet;
use std::fmt;
use std::io;
use thiserror::Error;

/// Largest payload of a classic CAN frame
pub const MAX_CAN_DATA_SIZE: usize = 8;

/// CAN 通信错误类型
#[derive(Debug, Clone, Error)]
pub enum CanError {
    /// 连接失败
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    /// 协议错误
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    /// 无效数据
    #[error("Invalid data: {0}")]
    InvalidData(String),
    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<io::Error> for CanError {
    fn from(error: io::Error) -> Self {
        CanError::ProtocolError(error.to_string())
    }
}

/// Transmit side of the module bus plus a non-blocking receive poll
pub trait BusDriver {
    /// 发送一帧
    fn send(&mut self, id: u32, data: &[u8]) -> Result<(), CanError>;

    /// Accept frames with this id; everything else is dropped on receive
    fn register_expected_id(&mut self, id: u32);

    /// Next pending frame with a registered id, `None` when the queue is empty
    fn receive(&mut self) -> Result<Option<(u32, Vec<u8>)>, CanError>;
}

/// Receive callback, may run between scheduled ticks
///
/// Implementations must only overwrite pending slots and never block.
pub trait FrameHandler {
    fn handle_frame(&self, id: u32, data: &[u8]);
}

/// CAN 配置结构体
#[derive(Debug, Clone)]
pub struct CanConfig {
    /// CAN 接口名称（如 "can0"）
    pub interface: String,
}

impl CanConfig {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
        }
    }

    /// 验证配置参数
    pub fn validate(&self) -> Result<(), CanError> {
        if self.interface.is_empty() {
            return Err(CanError::ConfigError("Interface cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// SocketCAN backed bus driver
pub struct CanDriver {
    /// CAN 配置
    config: CanConfig,
    /// CAN 套接字，可选以支持延迟连接
    socket: Option<CanSocket>,
    expected_ids: HashSet<u32>,
}

impl CanDriver {
    /// 创建新的 CanDriver 实例
    ///
    /// # 参数
    /// * `interface` - CAN 接口名称
    pub fn new(interface: &str) -> Self {
        Self::with_config(CanConfig::new(interface))
    }

    pub fn with_config(config: CanConfig) -> Self {
        Self {
            config,
            socket: None,
            expected_ids: HashSet::new(),
        }
    }

    /// 初始化 CAN 连接
    ///
    /// The bitrate is set up outside, e.g. `ip link set can0 type can bitrate 500000`.
    pub fn connect(&mut self) -> Result<(), CanError> {
        self.config.validate()?;

        let socket = CanSocket::open(&self.config.interface)
            .map_err(|e| CanError::ConnectionFailed(format!("{}: {}", self.config.interface, e)))?;
        socket.set_nonblocking(true)?;
        self.socket = Some(socket);
        log::info!("CAN interface {} opened", self.config.interface);
        Ok(())
    }

    /// 断开 CAN 连接
    pub fn disconnect(&mut self) {
        self.socket = None;
    }

    /// 检查连接是否已建立
    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    fn socket(&self) -> Result<&CanSocket, CanError> {
        self.socket
            .as_ref()
            .ok_or_else(|| CanError::ConnectionFailed("Not connected".to_string()))
    }

    fn to_frame(id: u32, data: &[u8]) -> Result<CanFrame, CanError> {
        if data.len() > MAX_CAN_DATA_SIZE {
            return Err(CanError::InvalidData(format!("{} bytes exceed a CAN frame", data.len())));
        }
        let id: Id = match StandardId::new(id as u16) {
            Some(sid) if id <= 0x7FF => Id::Standard(sid),
            _ => Id::Extended(
                ExtendedId::new(id)
                    .ok_or_else(|| CanError::InvalidData(format!("Invalid CAN id {:#x}", id)))?,
            ),
        };
        let frame = CanDataFrame::new(id, data)
            .ok_or_else(|| CanError::InvalidData("Invalid frame data".to_string()))?;
        Ok(CanFrame::Data(frame))
    }
}

impl BusDriver for CanDriver {
    fn send(&mut self, id: u32, data: &[u8]) -> Result<(), CanError> {
        let frame = Self::to_frame(id, data)?;
        self.socket()?.write_frame_insist(&frame)?;
        Ok(())
    }

    fn register_expected_id(&mut self, id: u32) {
        self.expected_ids.insert(id);
    }

    fn receive(&mut self) -> Result<Option<(u32, Vec<u8>)>, CanError> {
        loop {
            let frame = match self.socket()?.read_frame() {
                Ok(frame) => frame,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let CanFrame::Data(data_frame) = frame else {
                continue;
            };
            let id = match data_frame.id() {
                Id::Standard(sid) => sid.as_raw() as u32,
                Id::Extended(eid) => eid.as_raw(),
            };
            if self.expected_ids.contains(&id) {
                return Ok(Some((id, data_frame.data().to_vec())));
            }
        }
    }
}

impl Drop for CanDriver {
    /// 在结构体销毁时自动断开连接
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl fmt::Debug for CanDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanDriver")
            .field("config", &self.config)
            .field("connected", &self.socket.is_some())
            .field("expected_ids", &self.expected_ids.len())
            .finish()
    }
}
