pub const SECTOR_SIZE: usize = 512;
pub const NBUF: usize = 64;

pub const NDIRECT: usize = 123;
pub const NINDIRECT: usize = 128;
pub const NDOUBLY: usize = NINDIRECT * NINDIRECT;
pub const MAXSECTORS: usize = NDIRECT + NINDIRECT + NDOUBLY;
pub const MAXFILE: usize = MAXSECTORS * SECTOR_SIZE;

pub const INODE_MAGIC: u32 = 0x494e_4f44;
