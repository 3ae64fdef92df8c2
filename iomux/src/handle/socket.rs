use std::mem::ManuallyDrop;

use socket2::{Domain, SockAddr, Socket, Type};

use crate::handle::transfer::{block_transfer, Direction, Position, Transfer, TransferParams};
use crate::handle::{Handle, HandleView, IoOperation, NativeHandle, PlatformHandle};
use crate::sender::Sender;
use crate::Result;

/// A connected stream socket.
#[derive(Debug)]
pub struct SocketHandle {
    platform: PlatformHandle,
}

impl SocketHandle {
    /// An unconnected socket, to be connected with [`SocketHandle::connect`].
    pub fn new(domain: Domain, ty: Type) -> Result<SocketHandle> {
        Ok(SocketHandle::from_socket(Socket::new(domain, ty, None)?))
    }

    pub fn from_socket(socket: Socket) -> SocketHandle {
        SocketHandle {
            platform: PlatformHandle::new(into_native(socket), close_socket),
        }
    }

    /// A pair of connected stream sockets.
    #[cfg(unix)]
    pub fn pair() -> Result<(SocketHandle, SocketHandle)> {
        let (a, b) = Socket::pair(socket2::Domain::UNIX, socket2::Type::STREAM, None)?;
        Ok((SocketHandle::from_socket(a), SocketHandle::from_socket(b)))
    }

    pub fn read(&self, buffers: Vec<Vec<u8>>) -> Result<Transfer> {
        self.platform.block::<StreamRead>(TransferParams {
            position: Position::Stream,
            buffers,
        })
    }

    pub fn write(&self, buffers: Vec<Vec<u8>>) -> Result<Transfer> {
        self.platform.block::<StreamWrite>(TransferParams {
            position: Position::Stream,
            buffers,
        })
    }

    pub fn read_async(&self, buffers: Vec<Vec<u8>>) -> Sender<'_, StreamRead> {
        self.platform.sender(TransferParams {
            position: Position::Stream,
            buffers,
        })
    }

    pub fn write_async(&self, buffers: Vec<Vec<u8>>) -> Sender<'_, StreamWrite> {
        self.platform.sender(TransferParams {
            position: Position::Stream,
            buffers,
        })
    }

    pub fn connect(&self, address: SockAddr) -> Result<()> {
        self.platform.block::<StreamConnect>(address)
    }

    pub fn connect_async(&self, address: SockAddr) -> Sender<'_, StreamConnect> {
        self.platform.sender(address)
    }
}

impl Handle for SocketHandle {
    const NAME: &'static str = "socket";

    fn platform(&self) -> &PlatformHandle {
        &self.platform
    }

    fn platform_mut(&mut self) -> &mut PlatformHandle {
        &mut self.platform
    }
}

/// A socket listening for stream connections.
#[derive(Debug)]
pub struct ListenSocketHandle {
    platform: PlatformHandle,
}

impl ListenSocketHandle {
    pub fn bind(address: &SockAddr, backlog: i32) -> Result<ListenSocketHandle> {
        let socket = Socket::new(address.domain(), Type::STREAM, None)?;
        socket.bind(address)?;
        socket.listen(backlog)?;
        Ok(ListenSocketHandle::from_socket(socket))
    }

    pub fn from_socket(socket: Socket) -> ListenSocketHandle {
        ListenSocketHandle {
            platform: PlatformHandle::new(into_native(socket), close_socket),
        }
    }

    pub fn local_addr(&self) -> Result<SockAddr> {
        Ok(borrow_socket(self.platform.native()).local_addr()?)
    }

    pub fn accept(&self) -> Result<Accepted> {
        self.platform.block::<StreamAccept>(())
    }

    pub fn accept_async(&self) -> Sender<'_, StreamAccept> {
        self.platform.sender(())
    }
}

impl Handle for ListenSocketHandle {
    const NAME: &'static str = "listen_socket";

    fn platform(&self) -> &PlatformHandle {
        &self.platform
    }

    fn platform_mut(&mut self) -> &mut PlatformHandle {
        &mut self.platform
    }
}

/// A connection taken from a [`ListenSocketHandle`]. The socket starts out detached.
#[derive(Debug)]
pub struct Accepted {
    pub socket: SocketHandle,
    pub address: SockAddr,
}

fn into_native(socket: Socket) -> NativeHandle {
    #[cfg(unix)]
    let raw = std::os::unix::io::IntoRawFd::into_raw_fd(socket);
    #[cfg(windows)]
    let raw = std::os::windows::io::IntoRawSocket::into_raw_socket(socket) as _;
    NativeHandle::new(raw)
}

/// The socket behind a handle, without taking ownership of it.
fn borrow_socket(native: NativeHandle) -> ManuallyDrop<Socket> {
    #[cfg(unix)]
    let socket = unsafe { std::os::unix::io::FromRawFd::from_raw_fd(native.raw()) };
    #[cfg(windows)]
    let socket =
        unsafe { std::os::windows::io::FromRawSocket::from_raw_socket(native.raw() as _) };
    ManuallyDrop::new(socket)
}

#[cfg(unix)]
fn close_socket(native: NativeHandle) -> Result<()> {
    super::close_native(native)
}

#[cfg(windows)]
fn close_socket(native: NativeHandle) -> Result<()> {
    use std::os::windows::io::FromRawSocket;
    // Let socket2 pick closesocket.
    drop(unsafe { Socket::from_raw_socket(native.raw() as _) });
    Ok(())
}

#[derive(Debug)]
pub struct StreamRead;

impl IoOperation for StreamRead {
    type Handle = SocketHandle;
    type Params = TransferParams;
    type Output = Transfer;

    const INDEX: usize = 0;
    const NAME: &'static str = "stream_read";

    fn block(handle: &HandleView, params: TransferParams) -> Result<Transfer> {
        block_transfer(handle.native, Direction::Read, params)
    }
}

#[derive(Debug)]
pub struct StreamWrite;

impl IoOperation for StreamWrite {
    type Handle = SocketHandle;
    type Params = TransferParams;
    type Output = Transfer;

    const INDEX: usize = 1;
    const NAME: &'static str = "stream_write";

    fn block(handle: &HandleView, params: TransferParams) -> Result<Transfer> {
        block_transfer(handle.native, Direction::Write, params)
    }
}

#[derive(Debug)]
pub struct StreamConnect;

impl IoOperation for StreamConnect {
    type Handle = SocketHandle;
    type Params = SockAddr;
    type Output = ();

    const INDEX: usize = 2;
    const NAME: &'static str = "stream_connect";

    fn block(handle: &HandleView, address: SockAddr) -> Result<()> {
        borrow_socket(handle.native).connect(&address)?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct StreamAccept;

impl IoOperation for StreamAccept {
    type Handle = ListenSocketHandle;
    type Params = ();
    type Output = Accepted;

    const INDEX: usize = 0;
    const NAME: &'static str = "stream_accept";

    fn block(handle: &HandleView, _: ()) -> Result<Accepted> {
        let (socket, address) = borrow_socket(handle.native).accept()?;
        Ok(Accepted {
            socket: SocketHandle::from_socket(socket),
            address,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::multiplexer::BlockingMultiplexer;
    use std::rc::Rc;

    #[test]
    fn test_pair_round_trip() {
        let (mut a, b) = SocketHandle::pair().unwrap();
        a.attach(Rc::new(BlockingMultiplexer::new())).unwrap();

        let written = a.write(vec![b"ping".to_vec(), b"!".to_vec()]).unwrap();
        assert_eq!(5, written.transferred);

        let read = b.read(vec![vec![0; 4], vec![0; 1]]).unwrap();
        assert_eq!(5, read.transferred);
        assert_eq!(b"ping", &read.buffers[0][..]);
        assert_eq!(b"!", &read.buffers[1][..]);
    }

    #[test]
    fn test_accept_connection() {
        let multiplexer = Rc::new(BlockingMultiplexer::new());
        let any = SockAddr::from("127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap());
        let mut listener = ListenSocketHandle::bind(&any, 4).unwrap();
        listener.attach(multiplexer.clone()).unwrap();
        let address = listener.local_addr().unwrap();
        assert_ne!(Some(0), address.as_socket().map(|a| a.port()));

        let mut client = SocketHandle::new(Domain::IPV4, Type::STREAM).unwrap();
        client.attach(multiplexer).unwrap();
        // Completes against the backlog before anyone accepts.
        client.connect(address).unwrap();

        let accepted = listener.accept().unwrap();
        assert!(!accepted.socket.platform().is_attached());
        assert_eq!(
            Some(std::net::Ipv4Addr::LOCALHOST),
            accepted.address.as_socket_ipv4().map(|a| *a.ip())
        );

        client.write(vec![b"syn".to_vec()]).unwrap();
        let read = accepted.socket.read(vec![vec![0; 3]]).unwrap();
        assert_eq!(b"syn", &read.buffers[0][..]);
    }

    #[test]
    fn test_connect_refused() {
        // Bound but not listening, so nothing answers on the port.
        let any = SockAddr::from("127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap());
        let idle = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        idle.bind(&any).unwrap();
        let address = idle.local_addr().unwrap();

        let client = SocketHandle::new(Domain::IPV4, Type::STREAM).unwrap();
        assert_eq!(
            Err(crate::Error::Os(libc::ECONNREFUSED)),
            client.connect(address)
        );
    }

    #[test]
    fn test_read_after_peer_closed() {
        let (a, b) = SocketHandle::pair().unwrap();
        drop(a);
        let read = b.read(vec![vec![0; 8]]).unwrap();
        assert_eq!(0, read.transferred);
    }
}
