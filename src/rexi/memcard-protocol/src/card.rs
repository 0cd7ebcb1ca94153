// Flash geometry of a memory card
pub const PAGE_SIZE: usize = 0x200; // Sequential access wraps inside one page
pub const BLOCK_SIZE: usize = 0x2000; // Erase unit (sector)
pub const PROGRAMMING_BUFFER_SIZE: usize = 128;

// Bytes per megabit of card capacity
pub const MBIT_SIZE: usize = 1024 * 8 * 16;

// Nintendo brand card, returned by the Read-ID command
pub const NINTENDO_CARD_ID: u16 = 0xC221;

// Byte driven onto the line when the card has nothing to say
pub const IDLE_BYTE: u8 = 0xFF;

pub mod status {
    pub const BUSY: u8 = 0x80;
    pub const UNLOCKED: u8 = 0x40;
    pub const SLEEP: u8 = 0x20;
    pub const ERASE_ERROR: u8 = 0x10;
    pub const PROGRAM_ERROR: u8 = 0x08;
    pub const READY: u8 = 0x01;
}

/// Opcodes accepted in the first byte of a card transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    NintendoId = 0x00,
    ReadArray = 0x52,
    ArrayToBuffer = 0x53,
    SetInterrupt = 0x81,
    WriteBuffer = 0x82,
    ReadStatus = 0x83,
    ReadId = 0x85,
    ReadErrorBuffer = 0x86,
    WakeUp = 0x87,
    Sleep = 0x88,
    ClearStatus = 0x89,
    SectorErase = 0xF1,
    PageProgram = 0xF2,
    ExtraByteProgram = 0xF3,
    ChipErase = 0xF4,
}

impl Command {
    pub fn decode(opcode: u8) -> Option<Command> {
        let cmd = match opcode {
            0x00 => Command::NintendoId,
            0x52 => Command::ReadArray,
            0x53 => Command::ArrayToBuffer,
            0x81 => Command::SetInterrupt,
            0x82 => Command::WriteBuffer,
            0x83 => Command::ReadStatus,
            0x85 => Command::ReadId,
            0x86 => Command::ReadErrorBuffer,
            0x87 => Command::WakeUp,
            0x88 => Command::Sleep,
            0x89 => Command::ClearStatus,
            0xF1 => Command::SectorErase,
            0xF2 => Command::PageProgram,
            0xF3 => Command::ExtraByteProgram,
            0xF4 => Command::ChipErase,
            _ => return None,
        };
        Some(cmd)
    }

    pub fn opcode(self) -> u8 {
        self as u8
    }

    /// Commands that change the flash contents
    pub fn mutates_card(self) -> bool {
        matches!(
            self,
            Command::SectorErase
                | Command::PageProgram
                | Command::ExtraByteProgram
                | Command::ChipErase
        )
    }

    /// Commands a sleeping card still answers
    pub fn allowed_while_asleep(self) -> bool {
        matches!(
            self,
            Command::WakeUp | Command::ReadStatus | Command::NintendoId | Command::ReadId
        )
    }

    /// Number of address bytes following the opcode
    pub fn address_bytes(self) -> usize {
        match self {
            Command::ReadArray
            | Command::ArrayToBuffer
            | Command::WriteBuffer
            | Command::PageProgram
            | Command::ExtraByteProgram => 4,
            Command::SectorErase => 2,
            _ => 0,
        }
    }
}

/// Official card capacities, in megabits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CardSize {
    Mb4 = 4,     // 59 blocks
    Mb8 = 8,     // 123 blocks
    Mb16 = 16,   // 251 blocks
    Mb32 = 32,   // 507 blocks
    Mb64 = 64,   // 1019 blocks
    Mb128 = 128, // 2043 blocks
}

impl CardSize {
    pub fn from_megabits(megabits: u16) -> Option<CardSize> {
        match megabits {
            4 => Some(CardSize::Mb4),
            8 => Some(CardSize::Mb8),
            16 => Some(CardSize::Mb16),
            32 => Some(CardSize::Mb32),
            64 => Some(CardSize::Mb64),
            128 => Some(CardSize::Mb128),
            _ => None,
        }
    }

    pub fn megabits(self) -> u16 {
        self as u16
    }

    pub fn bytes(self) -> usize {
        self.megabits() as usize * MBIT_SIZE
    }

    /// User-visible save blocks (five are reserved for the filesystem)
    pub fn user_blocks(self) -> usize {
        self.bytes() / BLOCK_SIZE - 5
    }
}

/// Splits a card address into the AD1/AD2/AD3/BA wire bytes
pub fn encode_address(address: u32) -> [u8; 4] {
    [
        ((address >> 17) & 0xFF) as u8,
        ((address >> 9) & 0xFF) as u8,
        ((address >> 7) & 0x3) as u8,
        (address & 0x7F) as u8,
    ]
}

/// Folds the address byte received at `position` (1..=4) into `address`
pub fn decode_address_byte(address: u32, position: u32, byte: u8) -> u32 {
    match position {
        1 => (byte as u32) << 17, // AD1 starts a fresh address
        2 => address | ((byte as u32) << 9),
        3 => address | (((byte & 0x3) as u32) << 7),
        4 => address | (byte & 0x7F) as u32,
        _ => address,
    }
}

/// Post-increment that stays inside the current 512-byte page
pub fn next_in_page(address: u32) -> u32 {
    (address & !0x1FF) | (address.wrapping_add(1) & 0x1FF)
}

/// Builds the opcode + address bytes a host sends to start a command
pub fn command_header(cmd: Command, address: u32) -> [u8; 5] {
    let [ad1, ad2, ad3, ba] = encode_address(address);
    [cmd.opcode(), ad1, ad2, ad3, ba]
}

/// Recovers command and address from a header built by `command_header`
pub fn parse_command_header(header: [u8; 5]) -> Option<(Command, u32)> {
    let cmd = Command::decode(header[0])?;
    let address = (1..=4).fold(0u32, |address, position| {
        decode_address_byte(address, position, header[position as usize])
    });
    Some((cmd, address))
}

/// Byte returned at `position` of a Nintendo-ID transaction
pub fn nintendo_id_byte(megabits: u16, position: u32) -> u8 {
    if position == 1 {
        return 0x80; // dummy cycle
    }
    let word = megabits as u32;
    (word >> (24 - (((position - 2) & 3) * 8))) as u8
}

/// Byte returned at `position` of a Read-ID transaction
pub fn card_id_byte(card_id: u16, position: u32) -> u8 {
    if position == 1 || position & 1 == 0 {
        (card_id >> 8) as u8
    } else {
        card_id as u8
    }
}
