//! Deterministic Commands
//!
//! Commands are non-periodic player instructions ("buy item", "cast") sent
//! alongside input. They are encoded as `[u16 type][payload]` through the bit
//! stream and decoded back through a factory registry keyed by type.

use std::any::Any;
use std::collections::BTreeMap;

use crate::core::stream::{BitStream, Serializable, StreamError};

/// Command type identifier.
pub type CommandType = u16;

/// A player command.
pub trait DeterministicCommand: Send + Sync + 'static {
    /// Registered type id.
    fn command_type(&self) -> CommandType;
    /// Walk the payload fields.
    fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError>;
    /// For downcasting to the concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// Command encode/decode errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// No constructor registered for the type.
    #[error("Unknown command type {0}")]
    UnknownType(CommandType),
    /// Payload did not decode cleanly.
    #[error("Malformed command: {0}")]
    Malformed(String),
}

impl From<StreamError> for CommandError {
    fn from(e: StreamError) -> Self {
        CommandError::Malformed(e.to_string())
    }
}

type CommandCtor = Box<dyn Fn() -> Box<dyn DeterministicCommand> + Send + Sync>;

/// Registry of command constructors.
#[derive(Default)]
pub struct CommandFactory {
    ctors: BTreeMap<CommandType, CommandCtor>,
}

impl std::fmt::Debug for CommandFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandFactory")
            .field("types", &self.ctors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CommandFactory {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command type by its default instance.
    pub fn register<C: DeterministicCommand + Default>(&mut self) -> &mut Self {
        let ty = C::default().command_type();
        self.ctors.insert(ty, Box::new(|| Box::new(C::default())));
        self
    }

    /// True if `ty` has a constructor.
    pub fn is_registered(&self, ty: CommandType) -> bool {
        self.ctors.contains_key(&ty)
    }

    /// Encode a command as `[type][payload]`.
    pub fn encode(&self, command: &mut dyn DeterministicCommand) -> Result<Vec<u8>, CommandError> {
        let mut ty = command.command_type();
        if !self.is_registered(ty) {
            return Err(CommandError::UnknownType(ty));
        }
        let mut stream = BitStream::writer();
        stream.serialize_u16(&mut ty)?;
        command.serialize(&mut stream)?;
        Ok(stream.into_bytes())
    }

    /// Decode a command. Trailing bytes are rejected.
    pub fn decode(&self, bytes: &[u8]) -> Result<Box<dyn DeterministicCommand>, CommandError> {
        let mut stream = BitStream::reader(bytes.to_vec());
        let mut ty: CommandType = 0;
        stream.serialize_u16(&mut ty)?;
        let ctor = self.ctors.get(&ty).ok_or(CommandError::UnknownType(ty))?;
        let mut command = ctor();
        command.serialize(&mut stream)?;
        if stream.remaining() != 0 {
            return Err(CommandError::Malformed(format!("{} trailing bytes", stream.remaining())));
        }
        Ok(command)
    }
}

/// Blanket [`Serializable`] for boxed commands so they can be walked like state.
impl Serializable for Box<dyn DeterministicCommand> {
    fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
        DeterministicCommand::serialize(self.as_mut(), stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct SpawnCommand {
        kind: u32,
        count: u8,
    }

    impl DeterministicCommand for SpawnCommand {
        fn command_type(&self) -> CommandType {
            7
        }
        fn serialize(&mut self, stream: &mut BitStream) -> Result<(), StreamError> {
            stream.serialize_u32(&mut self.kind)?;
            stream.serialize_u8(&mut self.count)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_encode_decode() {
        let mut factory = CommandFactory::new();
        factory.register::<SpawnCommand>();

        let mut cmd = SpawnCommand { kind: 3, count: 2 };
        let bytes = factory.encode(&mut cmd).unwrap();
        assert_eq!(&bytes[..2], &7u16.to_le_bytes());

        let decoded = factory.decode(&bytes).unwrap();
        let spawn = decoded.as_any().downcast_ref::<SpawnCommand>().unwrap();
        assert_eq!(spawn, &cmd);
    }

    #[test]
    fn test_unknown_and_malformed() {
        let mut factory = CommandFactory::new();
        assert_eq!(
            factory.encode(&mut SpawnCommand::default()).unwrap_err(),
            CommandError::UnknownType(7)
        );

        factory.register::<SpawnCommand>();
        assert!(matches!(factory.decode(&[9, 0]), Err(CommandError::UnknownType(9))));
        assert!(matches!(factory.decode(&[7, 0, 1]), Err(CommandError::Malformed(_))));

        let mut bytes = factory.encode(&mut SpawnCommand::default()).unwrap();
        bytes.push(0);
        assert!(matches!(factory.decode(&bytes), Err(CommandError::Malformed(_))));
    }
}
